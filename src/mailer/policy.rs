//! Sender denylist for domains that publish a strict DMARC policy.
//!
//! Mail claiming to come from these domains is dropped by receivers unless it
//! was sent through the domain's own infrastructure, so we refuse to send it.

pub const BLOCKED_EMAILS: &[&str] = &[
    "@yahoo.com",
    "@y7mail.com",
    "@yahoo.at",
    "@yahoo.be",
    "@yahoo.bg",
    "@yahoo.cl",
    "@yahoo.co.hu",
    "@yahoo.co.id",
    "@yahoo.co.il",
    "@yahoo.co.kr",
    "@yahoo.co.th",
    "@yahoo.co.za",
    "@yahoo.com.co",
    "@yahoo.com.hr",
    "@yahoo.com.my",
    "@yahoo.com.pe",
    "@yahoo.com.ph",
    "@yahoo.com.sg",
    "@yahoo.com.tr",
    "@yahoo.com.tw",
    "@yahoo.com.ua",
    "@yahoo.com.ve",
    "@yahoo.com.vn",
    "@yahoo.cz",
    "@yahoo.dk",
    "@yahoo.ee",
    "@yahoo.fi",
    "@yahoo.hr",
    "@yahoo.hu",
    "@yahoo.ie",
    "@yahoo.lt",
    "@yahoo.lv",
    "@yahoo.nl",
    "@yahoo.no",
    "@yahoo.pl",
    "@yahoo.pt",
    "@yahoo.rs",
    "@yahoo.se",
    "@yahoo.si",
    "@yahoo.sk",
    "@yahoogroups.co.kr",
    "@yahoogroups.com.cn",
    "@yahoogroups.com.sg",
    "@yahoogroups.com.tw",
    "@yahoogrupper.dk",
    "@yahoogruppi.it",
    "@yahooxtra.co.nz",
];

/// First denylisted entry contained anywhere in `address`, if any.
///
/// Matching is case-sensitive substring containment, so `a@yahoo.com.au`
/// is blocked through `@yahoo.com`.
pub fn is_blocked(address: &str) -> Option<&'static str> {
    BLOCKED_EMAILS
        .iter()
        .copied()
        .find(|suffix| address.contains(suffix))
}
