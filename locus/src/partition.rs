use crate::error::{LocusError, Result};
use crate::identity::ProcessIdentity;
use crate::resolver::LocaleAssignment;
use crate::substrate::Substrate;

/// The two scopes a connection coordinates through.
pub struct Partition<S: Substrate + ?Sized> {
    /// Every process of the job.
    pub world: S::Scope,
    /// Only the processes of this process's locale.
    pub locale: S::Scope,
}

/// Split the default scope into node-local scopes. Collective.
///
/// The locale id is the split color and the global rank the key, so the
/// node-local scope ranks processes exactly as the locale assignment does.
/// With `verify` set, a disagreement is reported instead of trusted.
pub fn partition<S: Substrate + ?Sized>(
    substrate: &S,
    world: S::Scope,
    identity: &ProcessIdentity,
    assignment: &LocaleAssignment,
    verify: bool,
) -> Result<Partition<S>> {
    let locale = substrate.split(&world, assignment.locale, identity.rank)?;

    if verify {
        let scope_rank = substrate.scope_rank(&locale);
        let scope_size = substrate.scope_size(&locale);
        if scope_rank != assignment.locale_rank || scope_size != assignment.locale_size {
            return Err(LocusError::ScopeMismatch {
                locale_rank: assignment.locale_rank,
                locale_size: assignment.locale_size,
                scope_rank,
                scope_size,
            });
        }
    }

    tracing::debug!(
        rank = identity.rank,
        locale = assignment.locale,
        locale_rank = assignment.locale_rank,
        "node-local scope formed"
    );
    Ok(Partition { world, locale })
}
