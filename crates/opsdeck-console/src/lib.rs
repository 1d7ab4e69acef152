//! Operator console for a remote agent: live status channel, command relay and start
//! gating over the selected resources.

pub mod catalog;
pub mod channel;
pub mod config;
pub mod console;
pub mod gateway;
pub mod logging;
pub mod session;
pub mod surface;

pub use catalog::{CatalogClient, Picker};
pub use channel::{ChannelEvent, ChannelHandle, ChannelState, CloseReason, ConnectionManager};
pub use config::{ConfigError, ConfigFlags, ConsoleConfig};
pub use gateway::{CommandDispatch, CommandGateway};
pub use session::{ConsoleSession, Lookup};
pub use surface::{ControlSurface, Notice, StartBlocker};
