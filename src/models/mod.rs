//! Data models for followers, positions, intents and execution reports.

mod event;
mod follower;
mod intent;
mod position;
mod symbol;

pub use event::{ExecutionEvent, OrderKind};
pub use follower::{mask, ApiStatus, Credentials, Enablement, Follower, Platform};
pub use intent::{Intent, IntentKind, Transition};
pub use position::{PositionMode, PositionSide, Side, TraderPosition};
pub use symbol::SymbolInfo;
