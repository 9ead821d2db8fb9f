use crate::db::models::Direction;

/// Extracts the lowercased domain after the final '@'. Addresses without an
/// '@' or with nothing after it yield an empty string.
fn address_domain(address: &str) -> String {
    match address.trim().rsplit_once('@') {
        Some((_, domain)) => domain.trim().to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Classifies a message relative to a tenant's internal domains.
///
/// Both sides internal is Internal, sender-only is Outbound, recipient-only
/// is Inbound. When neither side matches, or the internal domain list is
/// empty, the answer is Unknown.
pub fn classify(sender: &str, recipient: &str, internal_domains: &[String]) -> Direction {
    if internal_domains.is_empty() {
        return Direction::Unknown;
    }

    let sender_domain = address_domain(sender);
    let recipient_domain = address_domain(recipient);

    let is_internal = |domain: &str| {
        !domain.is_empty() && internal_domains.iter().any(|d| d == domain)
    };

    match (is_internal(&sender_domain), is_internal(&recipient_domain)) {
        (true, true) => Direction::Internal,
        (true, false) => Direction::Outbound,
        (false, true) => Direction::Inbound,
        (false, false) => Direction::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::{address_domain, classify};
    use crate::db::models::Direction;

    fn domains() -> Vec<String> {
        vec!["contoso.com".to_string(), "contoso.net".to_string()]
    }

    #[test]
    fn classifies_all_four_quadrants() {
        let d = domains();
        assert_eq!(
            classify("a@contoso.com", "b@contoso.net", &d),
            Direction::Internal
        );
        assert_eq!(
            classify("a@contoso.com", "b@fabrikam.com", &d),
            Direction::Outbound
        );
        assert_eq!(
            classify("a@fabrikam.com", "b@contoso.com", &d),
            Direction::Inbound
        );
        assert_eq!(
            classify("a@fabrikam.com", "b@adatum.org", &d),
            Direction::Unknown
        );
    }

    #[test]
    fn empty_domain_list_is_unknown() {
        assert_eq!(
            classify("a@contoso.com", "b@contoso.com", &[]),
            Direction::Unknown
        );
    }

    #[test]
    fn comparison_ignores_case_and_whitespace() {
        let d = domains();
        assert_eq!(
            classify(" A@CONTOSO.COM ", "b@Fabrikam.com", &d),
            Direction::Outbound
        );
    }

    #[test]
    fn malformed_addresses_never_match() {
        let d = domains();
        assert_eq!(classify("no-at-sign", "b@contoso.com", &d), Direction::Inbound);
        assert_eq!(classify("", "", &d), Direction::Unknown);
        assert_eq!(address_domain("odd@"), "");
        // The domain after the final '@' wins for quoted local parts.
        assert_eq!(address_domain("\"a@b\"@contoso.com"), "contoso.com");
    }
}
