mod audit;
mod auth;
mod rbac;

pub use audit::{
    AuditEvent, AuditEventInput, AuditExportDoc, AuditLog, AuditLogConfig, AuditQuery,
    AuditResult, AuditSeverity, IntegrityReport, ResourceRef,
};
pub use auth::{AuthService, TokenPair};
pub use rbac::{Action, Permission, RbacStore, ResourceType, Role, UserRecord};
