use crate::backend::{IndexError, MetadataIndex};
use crate::identifier::InstanceIdentifier;
use crate::types::ResourceLevel;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// The result of [`IdentifierResolver::resolve`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
	/// Fully specified instances, deduplicated.
	pub resolved: BTreeSet<InstanceIdentifier>,
	/// Input identifiers that matched no instance, in the form they were supplied.
	pub unresolved: BTreeSet<InstanceIdentifier>,
	/// Number of identifiers whose lookup failed. These are part of `unresolved` as well.
	pub failures: usize,
}

/// Expands study and series identifiers into their instances.
pub struct IdentifierResolver {
	index: Arc<dyn MetadataIndex>,
}

impl IdentifierResolver {
	pub fn new(index: Arc<dyn MetadataIndex>) -> Self {
		Self { index }
	}

	/// Each identifier is resolved on its own. A failed lookup marks only that identifier as
	/// unresolved.
	pub async fn resolve<'a>(
		&self,
		identifiers: impl IntoIterator<Item = &'a InstanceIdentifier>,
	) -> Resolution {
		let mut resolution = Resolution::default();

		for identifier in identifiers {
			match self.expand(identifier).await {
				Ok(instances) if !instances.is_empty() => {
					debug!(%identifier, count = instances.len(), "Resolved identifier");
					resolution.resolved.extend(instances);
				}
				Ok(_) => {
					debug!(%identifier, "Identifier does not match any instance");
					resolution.unresolved.insert(identifier.clone());
				}
				Err(err) => {
					warn!(%identifier, "Failed to resolve identifier: {err}");
					resolution.failures += 1;
					resolution.unresolved.insert(identifier.clone());
				}
			}
		}

		resolution
	}

	/// Resolves a single identifier into its instances.
	pub async fn expand(
		&self,
		identifier: &InstanceIdentifier,
	) -> Result<Vec<InstanceIdentifier>, IndexError> {
		let study = identifier.study_instance_uid();
		match (identifier.level(), identifier.series_instance_uid()) {
			(ResourceLevel::Instance, _) => {
				let exists = self.index.contains_instance(identifier).await?;
				Ok(if exists {
					vec![identifier.clone()]
				} else {
					Vec::new()
				})
			}
			(ResourceLevel::Series, Some(series)) => {
				self.index.list_instances_in_series(study, series).await
			}
			_ => self.index.list_instances_in_study(study).await,
		}
	}
}
