//! Connection lifecycle: the supervisor and the command endpoint in front of it

pub mod endpoint;
pub mod supervisor;

pub use endpoint::{CommandMessage, CommandSender, Endpoint, ReplyAddress};
pub use supervisor::{StatusReader, Supervisor};
