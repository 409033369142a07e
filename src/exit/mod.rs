// =============================================================================
// Exit Management Module
// =============================================================================
//
// Apex-drawdown exit: track the highest price seen since entry and sell once
// the price has stayed below that apex for longer than the drop threshold.
// One background monitor task per held symbol, owned by the registry.

pub mod apex;
pub mod monitor;
pub mod registry;

pub use monitor::MonitorExit;
pub use registry::MonitorSnapshot;
