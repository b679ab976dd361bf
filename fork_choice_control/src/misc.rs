/// Policy for blocks passed to [`Controller::process_chain_segment`].
///
/// [`Controller::process_chain_segment`]: crate::Controller::process_chain_segment
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
#[expect(clippy::struct_excessive_bools)]
pub struct ImportBlockOptions {
    /// Drop blocks that are already in the store instead of failing.
    /// Also drops the genesis block.
    pub ignore_if_known: bool,
    /// Drop blocks at or before the finalized slot instead of failing.
    pub ignore_if_finalized: bool,
    /// Skip signature verification entirely.
    pub valid_signatures: bool,
    /// Skip verification of block proposer signatures only.
    pub valid_proposer_signature: bool,
}
