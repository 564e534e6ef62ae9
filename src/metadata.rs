//! Annotation schema and metadata aggregation
//!
//! All rotated objects carry a small set of `trellis.dev/` annotations that
//! drive the rotation decisions, plus owner references aggregated across
//! every controller that writes the object. Aggregation is append-only:
//! later writers add their own owner reference but never rewrite existing
//! entries, and the `owning-component` annotation keeps the first writer's
//! value forever.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use duration_string::DurationString;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::warn;

/// Annotation naming the artifact kind: `signer`, `ca-bundle`, `serving`, `client`
pub const CERTIFICATE_TYPE_ANNOTATION: &str = "trellis.dev/certificate-type";

/// Annotation holding the certificate's RFC3339 NotBefore instant
pub const NOT_BEFORE_ANNOTATION: &str = "trellis.dev/certificate-not-before";

/// Annotation holding the certificate's RFC3339 NotAfter instant
pub const NOT_AFTER_ANNOTATION: &str = "trellis.dev/certificate-not-after";

/// Annotation naming the CommonName of the CA that signed a leaf
pub const ISSUER_ANNOTATION: &str = "trellis.dev/certificate-issuer";

/// Annotation listing a serving certificate's hostnames, comma-joined
pub const HOSTNAMES_ANNOTATION: &str = "trellis.dev/certificate-hostnames";

/// Annotation holding a duration after NotBefore at which the certificate is
/// rotated early, regardless of the refresh policy
pub const AUTO_REGENERATE_AFTER_OFFSET_ANNOTATION: &str =
    "trellis.dev/auto-regenerate-after-offset";

/// Annotation tagging the component that first created the object
pub const OWNING_COMPONENT_ANNOTATION: &str = "trellis.dev/owning-component";

/// Kind of certificate artifact an object holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateType {
    /// Self-signed signing CA certificate and key
    Signer,
    /// Trust bundle of CA certificates
    CaBundle,
    /// Serving (TLS server) leaf certificate
    Serving,
    /// Client (mTLS client) leaf certificate
    Client,
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertificateType::Signer => "signer",
            CertificateType::CaBundle => "ca-bundle",
            CertificateType::Serving => "serving",
            CertificateType::Client => "client",
        };
        f.write_str(s)
    }
}

impl FromStr for CertificateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signer" => Ok(CertificateType::Signer),
            "ca-bundle" => Ok(CertificateType::CaBundle),
            "serving" => Ok(CertificateType::Serving),
            "client" => Ok(CertificateType::Client),
            _ => Err(()),
        }
    }
}

impl CertificateType {
    /// Read the certificate type annotation from object metadata
    pub fn from_object_meta(meta: &ObjectMeta) -> Option<CertificateType> {
        meta.annotations
            .as_ref()
            .and_then(|a| a.get(CERTIFICATE_TYPE_ANNOTATION))
            .and_then(|v| v.parse().ok())
    }

    /// Stamp the certificate type annotation; returns true if it changed
    pub fn apply(self, meta: &mut ObjectMeta) -> bool {
        set_annotation(meta, CERTIFICATE_TYPE_ANNOTATION, &self.to_string())
    }
}

/// Operator-supplied annotations applied to every rotated object
#[derive(Debug, Clone, Default)]
pub struct AdditionalAnnotations {
    /// Free-form owner tag, written once at create time and never rewritten
    pub owning_component: Option<String>,
}

impl AdditionalAnnotations {
    /// Apply to object metadata; returns true if anything changed.
    ///
    /// The owning-component value is only written when the object does not
    /// already carry one, so the first writer wins.
    pub fn ensure(&self, meta: &mut ObjectMeta) -> bool {
        let Some(component) = &self.owning_component else {
            return false;
        };
        let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
        if annotations
            .get(OWNING_COMPONENT_ANNOTATION)
            .is_some_and(|v| !v.is_empty())
        {
            return false;
        }
        annotations.insert(OWNING_COMPONENT_ANNOTATION.to_string(), component.clone());
        true
    }
}

/// Append an owner reference if no equivalent entry exists.
///
/// Existing entries are never rewritten; matching is by uid when both sides
/// have one, otherwise by (apiVersion, kind, name). Returns true if the
/// reference was appended.
pub fn ensure_owner_ref(meta: &mut ObjectMeta, owner: &OwnerReference) -> bool {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if refs.iter().any(|existing| same_owner(existing, owner)) {
        return false;
    }
    refs.push(owner.clone());
    true
}

/// Whether the metadata already lists an equivalent owner reference
pub fn has_owner_ref(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|existing| same_owner(existing, owner)))
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    if !a.uid.is_empty() && !b.uid.is_empty() {
        return a.uid == b.uid;
    }
    a.api_version == b.api_version && a.kind == b.kind && a.name == b.name
}

/// Stamp the validity-window annotations; returns true if either changed
pub fn set_validity_annotations(
    meta: &mut ObjectMeta,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> bool {
    let before = set_annotation(
        meta,
        NOT_BEFORE_ANNOTATION,
        &not_before.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    let after = set_annotation(
        meta,
        NOT_AFTER_ANNOTATION,
        &not_after.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    before || after
}

/// Read a named annotation
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Set a named annotation; returns true if the stored value changed
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) -> bool {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    if annotations.get(key).is_some_and(|v| v == value) {
        return false;
    }
    annotations.insert(key.to_string(), value.to_string());
    true
}

/// Whether the auto-regenerate offset annotation has elapsed.
///
/// Returns true when the annotation is present, parses, and
/// `now >= not_before + offset`. An unparsable value is logged and ignored;
/// a bad runtime knob must never wedge reconciliation.
pub fn regenerate_offset_elapsed(
    meta: &ObjectMeta,
    not_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let Some(raw) = annotation(meta, AUTO_REGENERATE_AFTER_OFFSET_ANNOTATION) else {
        return false;
    };
    match parse_duration(raw) {
        Some(offset) => {
            let due = not_before + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero());
            now >= due
        }
        None => {
            warn!(
                annotation = AUTO_REGENERATE_AFTER_OFFSET_ANNOTATION,
                value = raw,
                "ignoring unparsable duration annotation"
            );
            false
        }
    }
}

/// Parse a duration string such as `12h`, `30m`, `90s`, or `7d2h`
pub fn parse_duration(input: &str) -> Option<Duration> {
    DurationString::from_string(input.trim().to_string())
        .ok()
        .map(Into::into)
}

/// Render a duration in the string form accepted by [`parse_duration`]
pub fn format_duration(duration: Duration) -> String {
    DurationString::from(duration).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn owner(name: &str) -> OwnerReference {
        OwnerReference {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn owner_ref_is_appended_exactly_once() {
        let mut meta = ObjectMeta::default();

        assert!(ensure_owner_ref(&mut meta, &owner("operator-1")));
        assert!(!ensure_owner_ref(&mut meta, &owner("operator-1")));
        assert!(ensure_owner_ref(&mut meta, &owner("operator-2")));

        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "operator-1");
        assert_eq!(refs[1].name, "operator-2");
    }

    #[test]
    fn owner_ref_matches_by_uid_when_present() {
        let mut meta = ObjectMeta::default();
        let mut a = owner("renamed");
        a.uid = "abc-123".to_string();
        let mut b = owner("original");
        b.uid = "abc-123".to_string();

        assert!(ensure_owner_ref(&mut meta, &a));
        // Same uid under a different name is the same owner.
        assert!(!ensure_owner_ref(&mut meta, &b));
        assert_eq!(meta.owner_references.unwrap().len(), 1);
    }

    #[test]
    fn owning_component_keeps_first_writer() {
        let mut meta = ObjectMeta::default();

        let first = AdditionalAnnotations {
            owning_component: Some("apiserver".to_string()),
        };
        assert!(first.ensure(&mut meta));

        let second = AdditionalAnnotations {
            owning_component: Some("etcd".to_string()),
        };
        assert!(!second.ensure(&mut meta));

        assert_eq!(
            annotation(&meta, OWNING_COMPONENT_ANNOTATION),
            Some("apiserver")
        );
    }

    #[test]
    fn certificate_type_round_trips_through_annotation() {
        let mut meta = ObjectMeta::default();
        assert!(CertificateType::CaBundle.apply(&mut meta));
        assert!(!CertificateType::CaBundle.apply(&mut meta));
        assert_eq!(
            CertificateType::from_object_meta(&meta),
            Some(CertificateType::CaBundle)
        );
    }

    #[test]
    fn validity_annotations_are_rfc3339() {
        let mut meta = ObjectMeta::default();
        let not_before = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let not_after = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();

        assert!(set_validity_annotations(&mut meta, not_before, not_after));
        assert_eq!(
            annotation(&meta, NOT_BEFORE_ANNOTATION),
            Some("2025-06-01T12:00:00Z")
        );
        assert_eq!(
            annotation(&meta, NOT_AFTER_ANNOTATION),
            Some("2025-06-02T12:00:00Z")
        );
        // Re-stamping identical values reports no change.
        assert!(!set_validity_annotations(&mut meta, not_before, not_after));
    }

    mod durations {
        use super::*;

        #[test]
        fn simple_units() {
            assert_eq!(parse_duration("12h"), Some(Duration::from_secs(12 * 3600)));
            assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
            assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
            assert_eq!(parse_duration("5d"), Some(Duration::from_secs(5 * 24 * 3600)));
        }

        #[test]
        fn compound_values() {
            assert_eq!(
                parse_duration("7d2h"),
                Some(Duration::from_secs((7 * 24 + 2) * 3600))
            );
            assert_eq!(
                parse_duration("1h30m"),
                Some(Duration::from_secs(3600 + 1800))
            );
        }

        #[test]
        fn garbage_is_rejected() {
            assert_eq!(parse_duration(""), None);
            assert_eq!(parse_duration("soon"), None);
            assert_eq!(parse_duration("15"), None);
        }

        #[test]
        fn formatting_round_trips() {
            for d in [
                Duration::from_secs(8 * 3600),
                Duration::from_secs(3600 + 1800),
                Duration::from_secs(45),
            ] {
                assert_eq!(parse_duration(&format_duration(d)), Some(d));
            }
        }
    }

    mod regenerate_offset {
        use super::*;

        fn meta_with_offset(value: &str) -> ObjectMeta {
            let mut meta = ObjectMeta::default();
            set_annotation(&mut meta, AUTO_REGENERATE_AFTER_OFFSET_ANNOTATION, value);
            meta
        }

        #[test]
        fn elapsed_offset_triggers() {
            let not_before = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
            let meta = meta_with_offset("8h");

            let before_due = not_before + chrono::Duration::hours(7);
            let after_due = not_before + chrono::Duration::hours(9);
            assert!(!regenerate_offset_elapsed(&meta, not_before, before_due));
            assert!(regenerate_offset_elapsed(&meta, not_before, after_due));
        }

        #[test]
        fn absent_or_garbage_never_triggers() {
            let not_before = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
            let far_future = not_before + chrono::Duration::days(365);

            assert!(!regenerate_offset_elapsed(
                &ObjectMeta::default(),
                not_before,
                far_future
            ));
            // A bad knob is ignored rather than forcing rotation.
            assert!(!regenerate_offset_elapsed(
                &meta_with_offset("whenever"),
                not_before,
                far_future
            ));
        }
    }
}
