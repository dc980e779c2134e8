//! Stateless repositories — every method takes a `&Connection`.

pub mod agent_session;
pub mod conversation;
pub mod kv;
pub mod message;
pub mod plan;
pub mod user;

pub use agent_session::AgentSessionRepo;
pub use conversation::ConversationRepo;
pub use kv::KvRepo;
pub use message::MessageRepo;
pub use plan::PlanRepo;
pub use user::UserRepo;
