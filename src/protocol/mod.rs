//! Tool invocation protocol: parsing, normalization and dispatch-mode
//! selection for model output.

pub mod dispatch;
pub mod invocation;
pub mod message;
pub mod normalize;

pub use dispatch::{DispatchMode, ToolReply, assemble_turn};
pub use invocation::{ToolInvocation, clean_content, extract_invocations, parse_tag_invocations};
pub use message::{DeclaredToolCall, Message, Role};
pub use normalize::normalize_messages;
