use oews_warehouse::ValueDomain;
use proptest::prelude::*;

fn any_domain() -> impl Strategy<Value = ValueDomain> {
    prop_oneof![
        Just(ValueDomain::Integer),
        Just(ValueDomain::Decimal),
        Just(ValueDomain::Text),
        Just(ValueDomain::LongText),
        Just(ValueDomain::Boolean),
        Just(ValueDomain::Date),
        Just(ValueDomain::DateTime),
    ]
}

/// `a` is representable under `b` when joining them changes nothing.
fn representable_under(a: ValueDomain, b: ValueDomain) -> bool {
    a.resolve(b) == b
}

proptest! {
    #[test]
    fn resolve_is_commutative(a in any_domain(), b in any_domain()) {
        prop_assert_eq!(a.resolve(b), b.resolve(a));
    }

    #[test]
    fn resolve_is_associative(a in any_domain(), b in any_domain(), c in any_domain()) {
        prop_assert_eq!(a.resolve(b).resolve(c), a.resolve(b.resolve(c)));
    }

    #[test]
    fn resolve_is_idempotent(a in any_domain()) {
        prop_assert_eq!(a.resolve(a), a);
    }

    #[test]
    fn resolve_is_at_least_as_permissive_as_both_inputs(
        a in any_domain(),
        b in any_domain(),
    ) {
        let joined = a.resolve(b);
        prop_assert!(representable_under(a, joined));
        prop_assert!(representable_under(b, joined));
    }

    #[test]
    fn fold_order_never_changes_the_outcome(
        mut domains in proptest::collection::vec(any_domain(), 1..6),
    ) {
        let forward = ValueDomain::resolve_all(domains.iter().copied()).unwrap();
        domains.reverse();
        let backward = ValueDomain::resolve_all(domains.iter().copied()).unwrap();
        prop_assert_eq!(forward, backward);
    }
}
