//! Name-tag lookup layer over the provider's native identifiers.
//!
//! Names are a convention, not a guaranteed-unique key, so every lookup
//! classifies the raw match list into an explicit [`Lookup`] variant.
//! Callers branch on the variant; nothing in the crate decides control
//! flow by whether a provider call raised.

use thiserror::Error;

use crate::provider::{Instance, Provider, Snapshot, Volume};

/// Outcome of resolving a logical name against provider resources.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Lookup<T> {
    /// Exactly one resource carries the name.
    Found(T),
    /// Nothing carries the name.
    NotFound,
    /// The name convention was violated; silently picking one match would
    /// be unsafe, so all of them are reported.
    Ambiguous(Vec<T>),
}

impl<T> Lookup<T> {
    /// Classifies a raw match list.
    #[must_use]
    pub fn classify(mut matches: Vec<T>) -> Self {
        match matches.len() {
            0 => Self::NotFound,
            1 => match matches.pop() {
                Some(only) => Self::Found(only),
                None => Self::NotFound,
            },
            _ => Self::Ambiguous(matches),
        }
    }

    /// Returns the resource when exactly one was found.
    #[must_use]
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(resource) => Some(resource),
            Self::NotFound | Self::Ambiguous(_) => None,
        }
    }
}

impl<T: Identified> Lookup<T> {
    /// Demands exactly one match.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NotFound`] or [`LookupError::Ambiguous`]
    /// (listing every matching id) otherwise.
    pub fn require(self, kind: &'static str, name: &str) -> Result<T, LookupError> {
        match self {
            Self::Found(resource) => Ok(resource),
            Self::NotFound => Err(LookupError::NotFound {
                kind,
                name: name.to_owned(),
            }),
            Self::Ambiguous(matches) => Err(LookupError::Ambiguous {
                kind,
                name: name.to_owned(),
                ids: matches.iter().map(|m| m.resource_id().to_owned()).collect(),
            }),
        }
    }

    /// Accepts zero or one match.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Ambiguous`] when the name is not unique.
    pub fn at_most_one(self, kind: &'static str, name: &str) -> Result<Option<T>, LookupError> {
        match self {
            Self::Found(resource) => Ok(Some(resource)),
            Self::NotFound => Ok(None),
            Self::Ambiguous(matches) => Err(LookupError::Ambiguous {
                kind,
                name: name.to_owned(),
                ids: matches.iter().map(|m| m.resource_id().to_owned()).collect(),
            }),
        }
    }
}

/// Resources addressable by a provider identifier.
pub trait Identified {
    /// The provider identifier.
    fn resource_id(&self) -> &str;
}

impl Identified for Instance {
    fn resource_id(&self) -> &str {
        &self.id
    }
}

impl Identified for Volume {
    fn resource_id(&self) -> &str {
        &self.id
    }
}

impl Identified for Snapshot {
    fn resource_id(&self) -> &str {
        &self.id
    }
}

/// Errors raised when a name does not resolve to exactly one resource.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LookupError {
    /// The name matched nothing.
    #[error("no {kind} named {name}")]
    NotFound {
        /// Resource kind being looked up.
        kind: &'static str,
        /// Logical name that failed to resolve.
        name: String,
    },
    /// The name matched more than one resource.
    #[error("more than one {kind} named {name}: {ids:?}")]
    Ambiguous {
        /// Resource kind being looked up.
        kind: &'static str,
        /// Logical name that failed to resolve.
        name: String,
        /// Every matching provider identifier.
        ids: Vec<String>,
    },
}

/// Uniqueness-checked lookups and tag helpers over a [`Provider`].
#[derive(Debug)]
pub struct Directory<'a, P> {
    provider: &'a P,
}

impl<'a, P: Provider> Directory<'a, P> {
    /// Wraps a provider reference.
    #[must_use]
    pub const fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    /// Resolves an instance name.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the underlying listing fails.
    pub async fn instance(&self, name: &str) -> Result<Lookup<Instance>, P::Error> {
        Ok(Lookup::classify(self.provider.find_instances(name).await?))
    }

    /// Resolves a volume name.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the underlying listing fails.
    pub async fn volume(&self, name: &str) -> Result<Lookup<Volume>, P::Error> {
        Ok(Lookup::classify(self.provider.find_volumes(name).await?))
    }

    /// All snapshots sharing a name; names are expected to repeat here as
    /// snapshots accumulate over disconnect cycles.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the underlying listing fails.
    pub async fn snapshots(&self, name: &str) -> Result<Vec<Snapshot>, P::Error> {
        self.provider.find_snapshots(name).await
    }

    /// The newest snapshot carrying a name, by provider start time.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the underlying listing fails.
    pub async fn latest_snapshot(&self, name: &str) -> Result<Option<Snapshot>, P::Error> {
        let mut snapshots = self.snapshots(name).await?;
        snapshots.sort_by(|lhs, rhs| lhs.start_time.cmp(&rhs.start_time));
        Ok(snapshots.pop())
    }

    /// Sets the `Name` tag on a resource.
    ///
    /// # Errors
    ///
    /// Returns the provider error when tagging fails.
    pub async fn set_name(&self, resource_id: &str, value: &str) -> Result<(), P::Error> {
        self.provider.tag(resource_id, "Name", value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{SnapshotState, VolumeState};
    use crate::test_support::FakeProvider;
    use rstest::rstest;

    fn volume(id: &str) -> Volume {
        Volume {
            id: id.to_owned(),
            name: String::from("data"),
            zone: String::from("us-east-1a"),
            state: VolumeState::Available,
            size_gib: 10,
            attachment: None,
        }
    }

    #[test]
    fn classify_maps_cardinality_to_variants() {
        assert_eq!(Lookup::<Volume>::classify(vec![]), Lookup::NotFound);
        assert_eq!(
            Lookup::classify(vec![volume("vol-1")]),
            Lookup::Found(volume("vol-1"))
        );
        assert!(matches!(
            Lookup::classify(vec![volume("vol-1"), volume("vol-2")]),
            Lookup::Ambiguous(_)
        ));
    }

    #[test]
    fn require_lists_every_ambiguous_match() {
        let err = Lookup::classify(vec![volume("vol-1"), volume("vol-2")])
            .require("volume", "data")
            .expect_err("two matches must not resolve");
        assert_eq!(
            err,
            LookupError::Ambiguous {
                kind: "volume",
                name: String::from("data"),
                ids: vec![String::from("vol-1"), String::from("vol-2")],
            }
        );
    }

    #[rstest]
    #[case(&["2024-03-01T09:00:00.000Z", "2024-05-01T09:00:00.000Z", "2024-04-01T09:00:00.000Z"])]
    #[case(&["2024-05-01T09:00:00.000Z", "2024-03-01T09:00:00.000Z", "2024-04-01T09:00:00.000Z"])]
    #[case(&["2024-04-01T09:00:00.000Z", "2024-03-01T09:00:00.000Z", "2024-05-01T09:00:00.000Z"])]
    #[tokio::test]
    async fn latest_snapshot_takes_maximum_start_time_for_any_order(#[case] times: &[&str]) {
        let provider = FakeProvider::new();
        for time in times {
            provider.seed_snapshot("data", time);
        }

        let directory = Directory::new(&provider);
        let latest = directory
            .latest_snapshot("data")
            .await
            .expect("fake provider does not fail")
            .expect("snapshots were seeded");
        assert_eq!(latest.start_time, "2024-05-01T09:00:00.000Z");
        assert_eq!(latest.state, SnapshotState::Completed);
    }

    #[tokio::test]
    async fn latest_snapshot_is_none_for_fresh_name() {
        let provider = FakeProvider::new();
        let directory = Directory::new(&provider);
        let latest = directory
            .latest_snapshot("data")
            .await
            .expect("fake provider does not fail");
        assert_eq!(latest, None);
    }
}
