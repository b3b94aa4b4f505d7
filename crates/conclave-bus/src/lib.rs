mod bus;
mod event_bus;
mod mailbox;

pub use bus::{spawn_redelivery_sweeper, MessageBus, RequestOptions, TopicSubscription};
pub use event_bus::EventBus;
pub use mailbox::{Mailbox, MailboxConfig};
