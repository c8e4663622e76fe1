use std::collections::HashSet;

/// Drop repeated addresses, keeping the first occurrence of each in order.
pub fn dedupe<S: AsRef<str>>(addresses: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(addresses.len());

    addresses
        .iter()
        .map(AsRef::as_ref)
        .filter(|address| seen.insert(*address))
        .map(str::to_string)
        .collect()
}
