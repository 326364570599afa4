//! Entry/hedge strategy: fair-price model, per-market phase machine,
//! fill-quality kill switch, and the engine that ties them together.

pub mod engine;
pub mod kill_switch;
pub mod model;
pub mod state;

pub use engine::{EngineStatus, StrategyEngine};
pub use kill_switch::{KillSwitch, KillSwitchStatus};
pub use model::{PriceCell, PriceModel, TableModel};
pub use state::{MarketState, Phase, SkipReason};
