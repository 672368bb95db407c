/// Minimal address and domain hierarchy utilities
pub struct DomainUtils;

impl DomainUtils {
    /// Extract domain from email address
    pub fn extract_domain(email: &str) -> Option<String> {
        let (_, domain) = email.rsplit_once('@')?;
        if domain.is_empty() {
            None
        } else {
            Some(domain.to_lowercase())
        }
    }

    /// Check if domain matches any in list (with hierarchy support)
    pub fn matches_domain_list(domain: &str, domain_list: &[String]) -> bool {
        let domain_lower = domain.to_lowercase();

        domain_list.iter().any(|pattern| {
            let pattern_lower = pattern.to_lowercase();
            domain_lower == pattern_lower || domain_lower.ends_with(&format!(".{}", pattern_lower))
        })
    }

    /// Canonicalize domain (lowercase, remove www prefix and trailing dot)
    pub fn canonicalize_domain(domain: &str) -> String {
        let domain_lower = domain.trim().trim_end_matches('.').to_lowercase();
        if let Some(stripped) = domain_lower.strip_prefix("www.") {
            stripped.to_string()
        } else {
            domain_lower
        }
    }

    /// Domain followed by its parents, most specific first.
    /// `mail.eu.client.com` yields `mail.eu.client.com`, `eu.client.com`, `client.com`.
    pub fn domain_hierarchy(domain: &str) -> Vec<String> {
        let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
        if labels.len() < 2 {
            return labels.iter().map(|l| l.to_string()).collect();
        }
        (0..labels.len() - 1)
            .map(|start| labels[start..].join("."))
            .collect()
    }

    /// Basic shape check for a mailbox address: one `@`, non-empty local part,
    /// dotted domain without whitespace.
    pub fn is_valid_address(address: &str) -> bool {
        let Some((local, domain)) = address.split_once('@') else {
            return false;
        };
        !local.is_empty()
            && !domain.is_empty()
            && !domain.contains('@')
            && domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && !address.chars().any(char::is_whitespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            DomainUtils::extract_domain("user@Example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(DomainUtils::extract_domain("invalid"), None);
        assert_eq!(DomainUtils::extract_domain("user@"), None);
    }

    #[test]
    fn test_matches_domain_list() {
        let domains = vec!["example.com".to_string(), "test.org".to_string()];

        assert!(DomainUtils::matches_domain_list("example.com", &domains));
        assert!(DomainUtils::matches_domain_list(
            "mail.example.com",
            &domains
        ));
        assert!(!DomainUtils::matches_domain_list("other.com", &domains));
        assert!(!DomainUtils::matches_domain_list("notexample.com", &domains));
    }

    #[test]
    fn test_canonicalize_domain() {
        assert_eq!(
            DomainUtils::canonicalize_domain("www.Example.com"),
            "example.com"
        );
        assert_eq!(
            DomainUtils::canonicalize_domain("example.com."),
            "example.com"
        );
    }

    #[test]
    fn test_domain_hierarchy() {
        assert_eq!(
            DomainUtils::domain_hierarchy("mail.eu.client.com"),
            vec!["mail.eu.client.com", "eu.client.com", "client.com"]
        );
        assert_eq!(DomainUtils::domain_hierarchy("client.com"), vec!["client.com"]);
    }

    #[test]
    fn test_valid_address() {
        assert!(DomainUtils::is_valid_address("known@client.com"));
        assert!(!DomainUtils::is_valid_address("known@client"));
        assert!(!DomainUtils::is_valid_address("@client.com"));
        assert!(!DomainUtils::is_valid_address("a b@client.com"));
        assert!(!DomainUtils::is_valid_address("a@b@client.com"));
    }
}
