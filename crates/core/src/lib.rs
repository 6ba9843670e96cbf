pub mod auth;
pub mod blob;
pub mod config;
pub mod forward;
pub mod gateway;
pub mod matcher;
pub mod message;
pub mod mime;
pub mod model;
pub mod normalizer;
pub mod notify;
pub mod pipeline;
pub mod poller;
pub mod resolver;
pub mod storage;
pub mod tls;
pub mod transport;
pub mod trigger;

pub use auth::*;
pub use blob::*;
pub use config::*;
pub use forward::*;
pub use gateway::*;
pub use matcher::*;
pub use message::*;
pub use mime::*;
pub use model::*;
pub use normalizer::*;
pub use notify::*;
pub use pipeline::*;
pub use poller::*;
pub use resolver::*;
pub use storage::*;
pub use tls::*;
pub use transport::*;
pub use trigger::*;
