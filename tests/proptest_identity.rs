//! Property-based tests for variant priorities, build identities and matrix
//! expansion.
//!
//! These tests verify that:
//! - Adding a recognized flag strictly raises priority; unknown flags add nothing
//! - Distinct (version, variant, runtime) triples never render the same identity
//! - Expansion is complete, duplicate-free and reproducible
//! - Release tags depend only on product, version and channel

use std::collections::HashSet;

use bonsai_release::identity::BuildIdentity;
use bonsai_release::matrix::{expand, MatrixCell, Platform, RuntimeVersion};
use bonsai_release::release::{Channel, ReleaseTarget};
use bonsai_release::variant::{PriorityRule, PriorityTable, VariantSet};
use proptest::prelude::*;
use time::Date;

fn banded_table() -> PriorityTable {
    PriorityTable::new(vec![
        PriorityRule::new("variant", "all", 100, "all"),
        PriorityRule::new("variant", "novtk", 200, "novtk"),
        PriorityRule::new("gui", "qt", 10, "qt"),
        PriorityRule::new("gui", "web", 20, "web"),
    ])
    .unwrap()
}

fn variant_choice(variant: u8, gui: u8) -> VariantSet {
    let mut set = VariantSet::new();
    match variant % 3 {
        1 => set = set.with("variant", "all"),
        2 => set = set.with("variant", "novtk"),
        _ => {}
    }
    match gui % 3 {
        1 => set = set.with("gui", "qt"),
        2 => set = set.with("gui", "web"),
        _ => {}
    }
    set
}

/// Versions such as `0.8.1`, `1.0-py3` or `0.9.2+local.1`.
fn arb_version() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[0-9][0-9a-z.+-]{0,6}").unwrap()
}

/// Runtime tags, some of which carry a '-' and must be refused.
fn arb_runtime_tag() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[a-z0-9][a-z0-9.+-]{0,5}").unwrap()
}

fn arb_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop::string::string_regex(r"[a-z][a-z0-9]{0,7}").unwrap(),
        1..6,
    )
    .prop_map(|mut names| {
        names.sort();
        names.dedup();
        names
    })
}

fn arb_runtimes() -> impl Strategy<Value = Vec<u16>> {
    prop::collection::vec(30u16..400, 1..5).prop_map(|mut versions| {
        versions.sort();
        versions.dedup();
        versions
    })
}

proptest! {
    /// Adding a recognized flag on a free axis strictly raises priority.
    #[test]
    fn priority_is_monotonic(variant in 0u8..3, gui in 1u8..3) {
        let table = banded_table();
        let without_gui = variant_choice(variant, 0);
        let with_gui = variant_choice(variant, gui);
        prop_assert!(table.priority(&with_gui) > table.priority(&without_gui));

        let base = variant_choice(0, gui);
        let with_variant = variant_choice(1 + variant % 2, gui);
        prop_assert!(table.priority(&with_variant) > table.priority(&base));
    }

    /// Same flags, same priority; unknown flags contribute nothing.
    #[test]
    fn priority_is_deterministic(variant in 0u8..3, gui in 0u8..3, axis in "[a-z]{3,8}", value in "[a-z]{1,8}") {
        prop_assume!(axis != "variant" && axis != "gui");
        let table = banded_table();
        let set = variant_choice(variant, gui);
        prop_assert_eq!(table.priority(&set), table.priority(&set.clone()));

        let noisy = set.clone().with(&axis, &value);
        prop_assert_eq!(table.priority(&noisy), table.priority(&set));
        prop_assert!(!table.unrecognized(&noisy).is_empty());
    }

    /// Distinct (version, variant, runtime) triples render distinct identities.
    #[test]
    fn identities_do_not_collide(
        triples in prop::collection::vec(
            (arb_version(), 0u8..3, 0u8..3, arb_runtime_tag()),
            1..24,
        ),
        base_build in 0u32..50,
    ) {
        let table = banded_table();
        let mut inputs = HashSet::new();
        let mut rendered = HashSet::new();
        for (version, variant, gui, runtime) in triples {
            let set = variant_choice(variant, gui);
            match BuildIdentity::for_variant(&table, &version, base_build, &set, &runtime, None) {
                Ok(identity) => {
                    inputs.insert((version, set, runtime));
                    rendered.insert(identity.render());
                }
                Err(_) => prop_assert!(runtime.contains('-')),
            }
        }
        prop_assert_eq!(inputs.len(), rendered.len());
    }

    /// Expansion yields |P| × |R| unique cells, the same way every time.
    #[test]
    fn expansion_is_complete_and_reproducible(names in arb_names(), versions in arb_runtimes()) {
        let platforms: Vec<Platform> = names.iter().map(|n| Platform::new(n).unwrap()).collect();
        let runtimes: Vec<RuntimeVersion> = versions
            .iter()
            .map(|v| RuntimeVersion::new(&v.to_string()).unwrap())
            .collect();

        let first = expand(&platforms, &runtimes).unwrap();
        let second = expand(&platforms, &runtimes).unwrap();
        prop_assert_eq!(first.len(), platforms.len() * runtimes.len());
        prop_assert_eq!(&first, &second);

        let unique: HashSet<&MatrixCell> = first.iter().collect();
        prop_assert_eq!(unique.len(), first.len());
        let ids: HashSet<String> = first.iter().map(MatrixCell::job_id).collect();
        prop_assert_eq!(ids.len(), first.len());
    }

    /// Stable tags never carry a date; nightly tags always do.
    #[test]
    fn release_tag_is_pure(ordinal in 1u16..=365, year in 2020i32..2060) {
        let date = Date::from_ordinal_date(year, ordinal).unwrap();
        let stable = ReleaseTarget::for_channel("bonsai", "0.9.2", Channel::Stable).unwrap();
        prop_assert_eq!(stable.tag.as_str(), "bonsai-0.9.2");

        let a = ReleaseTarget::for_channel("bonsai", "0.9.2", Channel::Nightly { date }).unwrap();
        let b = ReleaseTarget::for_channel("bonsai", "0.9.2", Channel::Nightly { date }).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert!(a.tag.starts_with("bonsai-0.9.2-alpha"));
        prop_assert_eq!(a.tag.len(), "bonsai-0.9.2-alpha".len() + 6);
    }
}
