//! Tool nodes: discovery and selection ([`picker`]), hand-off routing
//! ([`router`]) and the HTTP call itself ([`invoker`]).

pub mod invoker;
pub mod picker;
pub mod router;
pub mod selection;

pub use invoker::ToolInvoker;
pub use picker::ToolPicker;
pub use router::ToolRouter;
pub use selection::Selection;
