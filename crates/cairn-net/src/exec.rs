use cairn_protocol::Attribute;

use crate::dispatch::Responder;
use crate::error::NetResult;

/// External task-execution engine reached through `EXEC` attributes.
///
/// The executor may answer through `responder`. Its replies join the
/// request's reply stream and the returned status goes into the ack.
pub trait Executor: Send + Sync {
    fn execute(&self, responder: &mut Responder<'_>, attr: &Attribute<'_>) -> NetResult<()>;
}
