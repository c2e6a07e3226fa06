pub mod bitable;
pub mod doc;

pub use bitable::{
    BitableToolContext, ListTablesTool, RecordCreateTool, RecordDeleteTool, RecordGetTool,
    RecordUpdateTool, SearchMode, SearchTool,
};
pub use doc::DocSearchTool;

use std::sync::Arc;

use crate::registry::ToolRegistry;

/// Registers the full tool set against one shared context.
pub fn build_registry(context: Arc<BitableToolContext>, doc: DocSearchTool) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ListTablesTool { context: context.clone() });
    for mode in [
        SearchMode::Plain,
        SearchMode::Exact,
        SearchMode::Keyword,
        SearchMode::Person,
        SearchMode::DateRange,
    ] {
        registry.register(SearchTool { context: context.clone(), mode });
    }
    registry.register(RecordGetTool { context: context.clone() });
    registry.register(RecordCreateTool { context: context.clone() });
    registry.register(RecordUpdateTool { context: context.clone() });
    registry.register(RecordDeleteTool { context });
    registry.register(doc);
    registry
}
