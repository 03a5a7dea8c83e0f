//! Built-in profile table.
//!
//! Values come from field experience with each library: which ones need
//! more patience, which serve broken certificate chains, and which refuse
//! images above a certain edge length.

use std::collections::BTreeMap;

use super::SourceProfile;

fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
        .collect()
}

/// Built-in profiles in match order.
#[must_use]
pub fn builtin_profiles() -> Vec<SourceProfile> {
    vec![
        SourceProfile {
            max_concurrency: 2,
            timeout_multiplier: 3.0,
            max_attempts: 15,
            requires_tls_bypass: true,
            retry_backoff_ms: vec![2_000, 4_000, 8_000, 16_000, 30_000],
            ..SourceProfile::new(
                "verona",
                r"^https?://(www\.)?(nuovabibliotecamanoscritta\.it|nbm\.regione\.veneto\.it)/",
            )
        },
        SourceProfile {
            max_concurrency: 3,
            timeout_ms: Some(120_000),
            max_attempts: 5,
            ..SourceProfile::new("graz", r"^https?://(unipub|gams)\.uni-graz\.at/")
        },
        SourceProfile {
            max_concurrency: 3,
            timeout_ms: Some(120_000),
            requires_tls_bypass: true,
            max_image_dimension: Some(6000),
            required_headers: headers(&[("Referer", "https://cdm21059.contentdm.oclc.org/")]),
            ..SourceProfile::new("florence", r"^https?://cdm21059\.contentdm\.oclc\.org/")
        },
        SourceProfile {
            max_concurrency: 2,
            timeout_ms: Some(10_000),
            ..SourceProfile::new("rome", r"^https?://digitale\.bnc\.roma\.sbn\.it/")
        },
        SourceProfile {
            max_attempts: 8,
            ..SourceProfile::new("yale", r"^https?://collections\.library\.yale\.edu/")
        },
        SourceProfile {
            requires_tls_bypass: true,
            ..SourceProfile::new(
                "bodleian",
                r"^https?://(iiif|digital)\.bodleian\.ox\.ac\.uk/",
            )
        },
        SourceProfile {
            requires_tls_bypass: true,
            ..SourceProfile::new("grenoble", r"^https?://pagella\.bm-grenoble\.fr/")
        },
        SourceProfile {
            requires_tls_bypass: true,
            max_concurrency: 3,
            ..SourceProfile::new("bne", r"^https?://bdh-rd\.bne\.es/")
        },
        SourceProfile {
            requires_tls_bypass: true,
            max_concurrency: 3,
            ..SourceProfile::new("bdl", r"^https?://(www\.)?bdl\.servizirl\.it/")
        },
        SourceProfile {
            requires_tls_bypass: true,
            ..SourceProfile::new("mdc", r"^https?://mdc\.csuc\.cat/")
        },
        SourceProfile {
            max_image_dimension: Some(4000),
            ..SourceProfile::new("vatican", r"^https?://digi\.vatlib\.it/")
        },
        SourceProfile {
            max_image_dimension: Some(2000),
            ..SourceProfile::new(
                "manchester",
                r"^https?://(www\.)?digitalcollections\.manchester\.ac\.uk/",
            )
        },
        SourceProfile {
            max_concurrency: 3,
            rate_limit_delay_ms: 250,
            ..SourceProfile::new("e-manuscripta", r"^https?://(www\.)?e-manuscripta\.ch/")
        },
        SourceProfile {
            max_concurrency: 6,
            ..SourceProfile::new("heidelberg", r"^https?://digi\.ub\.uni-heidelberg\.de/")
        },
        SourceProfile {
            max_concurrency: 8,
            ..SourceProfile::new("gallica", r"^https?://gallica\.bnf\.fr/")
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::super::ProfileRegistry;

    #[test]
    fn test_verona_gets_long_timeouts_and_bypass() {
        let registry = ProfileRegistry::builtin().unwrap();
        let verona = registry.select("https://www.nuovabibliotecamanoscritta.it/Generale/x");
        assert_eq!(verona.name, "verona");
        assert!(verona.requires_tls_bypass);
        assert_eq!(
            verona.effective_timeout(Duration::from_secs(30)),
            Duration::from_secs(90)
        );
        assert_eq!(verona.max_attempts, 15);
    }

    #[test]
    fn test_size_ceilings() {
        let registry = ProfileRegistry::builtin().unwrap();
        assert_eq!(
            registry
                .select("https://digi.vatlib.it/iiif/MSS_Vat.lat.3225/manifest.json")
                .max_image_dimension,
            Some(4000)
        );
        assert_eq!(
            registry
                .select("https://cdm21059.contentdm.oclc.org/iiif/2/plutei:1/full/6000,/0/default.jpg")
                .max_image_dimension,
            Some(6000)
        );
    }

    #[test]
    fn test_builtin_concurrency_in_observed_safe_range() {
        for profile in super::builtin_profiles() {
            assert!(
                (2..=8).contains(&profile.max_concurrency),
                "{} has concurrency {}",
                profile.name,
                profile.max_concurrency
            );
        }
    }

    #[test]
    fn test_tls_bypass_is_never_the_default() {
        let registry = ProfileRegistry::builtin().unwrap();
        assert!(!registry.select("https://unknown.example/manifest").requires_tls_bypass);
    }
}
