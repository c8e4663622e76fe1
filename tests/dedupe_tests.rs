use std::collections::HashSet;

use mail_dispatch::mailer::dedupe::dedupe;
use proptest::prelude::*;

fn address() -> impl Strategy<Value = String> {
    // A small alphabet so duplicates are common.
    "[a-c]{1,2}@(x|y)\\.io"
}

proptest! {
    /// Test: No address appears twice in the output
    #[test]
    fn test_output_has_no_duplicates(list in prop::collection::vec(address(), 0..40)) {
        let deduped = dedupe(&list);
        let unique: HashSet<_> = deduped.iter().collect();
        prop_assert_eq!(unique.len(), deduped.len());
    }

    /// Test: Output is the first occurrences of the input, in input order
    #[test]
    fn test_first_seen_order_is_preserved(list in prop::collection::vec(address(), 0..40)) {
        let deduped = dedupe(&list);

        let mut expected = Vec::new();
        for a in &list {
            if !expected.contains(a) {
                expected.push(a.clone());
            }
        }
        prop_assert_eq!(deduped, expected);
    }

    /// Test: Deduplicating twice changes nothing
    #[test]
    fn test_dedupe_is_idempotent(list in prop::collection::vec(address(), 0..40)) {
        let once = dedupe(&list);
        prop_assert_eq!(dedupe(&once), once.clone());
    }

    /// Test: Every input address survives
    #[test]
    fn test_no_address_is_lost(list in prop::collection::vec(address(), 0..40)) {
        let deduped: HashSet<String> = dedupe(&list).into_iter().collect();
        let input: HashSet<String> = list.into_iter().collect();
        prop_assert_eq!(deduped, input);
    }
}
