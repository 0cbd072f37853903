// Service layer
//
// Thin facades over the definition store and the event log, holding the
// pool and engine limits so callers do not thread them everywhere. The
// execution engine itself is the facade for instance operations.

mod definition_service;
mod event_service;

pub use definition_service::DefinitionService;
pub use event_service::EventService;
