use hashbrown::HashSet;

use crate::{
    persist::codec::{CodecError, KeyValuePair},
    types::{DbOid, OperationState, TabletId},
};

/// Inputs of one dispatch cycle that come from outside the record.
#[derive(Debug, Clone, Default)]
pub struct DispatchScope {
    /// Every tablet of the source snapshot, complete or not.
    pub snapshot_tablets: HashSet<TabletId>,
    /// Optional database filter forwarded to tablet servers.
    pub db_oid: Option<DbOid>,
}

/// Capabilities shared by per-tablet distributed operations. The
/// coordinator drives any implementor the same way: prepare a batch,
/// feed results back, aggregate, persist.
pub trait TabletOperationState {
    /// RPC descriptor emitted per dispatched tablet.
    type Op;

    /// Next throttled batch of RPCs; empty when nothing is eligible.
    fn prepare_operations(&mut self, scope: &DispatchScope) -> Vec<Self::Op>;

    /// Recomputes the operation-wide state.
    fn aggregate(&mut self) -> OperationState;

    /// Bumps the version and encodes the record for the log.
    fn store_to_key_value_pair(&mut self) -> Result<KeyValuePair, CodecError>;
}
