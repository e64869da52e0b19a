// 公共类型、时钟、错误、配置与引擎上下文

pub mod types;
pub mod clock;
pub mod error;
pub mod config;
pub mod engine;

pub use types::*;
pub use clock::*;
pub use error::*;
pub use config::EngineConfig;
pub use engine::{EngineContext, EngineEvent, EofCallback, EofNotifier, EofSignal};
