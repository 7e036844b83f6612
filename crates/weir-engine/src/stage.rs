use crate::error::EngineResult;
use crate::session::Session;

/// The contract between the engine and a stage implementation.
///
/// Stages are invoked by an external scheduler (out of scope here) and
/// interact with records only through the session they are handed. The
/// trait is object-safe and `Send + Sync` so stage registries can hold
/// `Box<dyn Stage>`.
///
/// [`Engine::run_stage`](crate::Engine::run_stage) drives one invocation:
/// the session commits if `on_trigger` returns `Ok` and rolls back
/// otherwise — a stage never leaves a session open.
pub trait Stage: Send + Sync {
    /// Human-readable name of this stage (e.g. "route-by-type").
    fn name(&self) -> &str;

    /// Process records within the given session.
    fn on_trigger(&self, session: &mut Session<'_>) -> EngineResult<()>;
}
