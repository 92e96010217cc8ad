//! Robot agent access: wire protocol, command channel and UI search.

pub mod channel;
pub mod locator;
pub mod protocol;
pub mod ui_tree;

pub use channel::{CommandChannel, ConnectionState, RobotLink};
pub use locator::UiLocator;
pub use protocol::Command;
pub use ui_tree::{TextLabelParser, UiTreeParser};
