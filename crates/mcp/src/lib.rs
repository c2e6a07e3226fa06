//! Casebook tool server.
//!
//! Exposes the bitable backend as a set of named, schema-validated tools over
//! a plain HTTP surface:
//!
//! - `POST /mcp/tools/{tool_name}` — invoke a tool with `{ "params": {...} }`
//! - `GET /mcp/tools` — list tools and their parameter schemas
//! - `GET /health` — liveness probe
//!
//! Tools: `feishu.v1.bitable.{list_tables, search, search_exact,
//! search_keyword, search_person, search_date_range, record.get,
//! record.create, record.update, record.delete}` and `feishu.v1.doc.search`.
//!
//! The same binary also hosts the automation worker role (selected with
//! `ROLE=automation_worker`), which listens on its own port and owns the
//! rule engine's HTTP surface.

pub mod registry;
pub mod server;
pub mod tools;

pub use registry::{ParamKind, ParamSpec, Tool, ToolEnvelope, ToolRegistry};
pub use server::{router, serve};
pub use tools::{build_registry, BitableToolContext, DocSearchTool};

/// Version of the tool server.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
