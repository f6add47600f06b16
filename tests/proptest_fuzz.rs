//! Property-based tests (fuzzing) for the request pipeline and the outbox.
//!
//! Uses proptest to generate random/malformed inputs and verify the
//! classification, validation and persistence primitives never panic and
//! hold their invariants on every input.
//!
//! Run with: `cargo test --test proptest_fuzz`

use bytes::Bytes;
use proptest::prelude::*;

use opsync::compress::{is_zstd_compressed, maybe_compress, maybe_decompress};
use opsync::tenant::validate_tenant_id;
use opsync::{
    classify, ClassifierRules, HttpMethod, MutationState, Namespace, Purpose, QueuedMutation,
    RequestClass, SyncRequest, SyncResponse,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Tenant ids matching the accepted format
fn valid_tenant_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{1,50}"
}

fn purpose_strategy() -> impl Strategy<Value = Purpose> {
    prop_oneof![
        Just(Purpose::Static),
        Just(Purpose::Critical),
        Just(Purpose::Api),
        Just(Purpose::Dynamic),
    ]
}

/// Query pairs with unique keys, so ordering is the only variable
fn query_pairs_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec("[a-z]{1,8}", 1..6).prop_map(|values| {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("k{}", i), v))
            .collect()
    })
}

// =============================================================================
// Request Classification
// =============================================================================

proptest! {
    /// Every parseable URL lands in exactly one class, without panicking
    #[test]
    fn fuzz_classifier_is_total(
        path in "[a-zA-Z0-9._/-]{0,60}",
        query in "[a-z0-9=&]{0,40}",
    ) {
        let rules = ClassifierRules::default();
        let url = format!("https://ops.example.com/{}?{}", path, query);
        if let Ok(request) = SyncRequest::get(&url) {
            match classify(&rules, &request) {
                RequestClass::Static
                | RequestClass::NetworkOnly
                | RequestClass::Critical
                | RequestClass::Api
                | RequestClass::Dynamic => {}
            }
        }
    }

    /// A shell-asset suffix decides the class no matter where the path lives
    #[test]
    fn prop_static_suffix_always_wins(
        stem in "[a-z0-9/]{0,40}",
        suffix in prop_oneof![
            Just(".js"), Just(".css"), Just(".woff2"), Just(".png"),
            Just(".svg"), Just(".ico"), Just(".map"),
        ],
    ) {
        let rules = ClassifierRules::default();
        let url = format!("https://ops.example.com/{}{}", stem, suffix);
        let request = SyncRequest::get(&url).unwrap();
        prop_assert_eq!(classify(&rules, &request), RequestClass::Static);
    }

    /// Paths under a passthrough prefix never classify as cacheable
    #[test]
    fn prop_network_only_prefix_always_skips_cache(
        prefix in prop_oneof![
            Just("/api/realtime"), Just("/ws"), Just("/api/auth"),
            Just("/api/sync/conflicts"),
        ],
        tail in "(/[a-z0-9]{1,8}){0,3}",
    ) {
        let rules = ClassifierRules::default();
        let url = format!("https://ops.example.com{}{}", prefix, tail);
        let request = SyncRequest::get(&url).unwrap();
        prop_assert_eq!(classify(&rules, &request), RequestClass::NetworkOnly);
    }

    /// Plain single-segment API paths fall through to the generic class
    #[test]
    fn prop_unmatched_api_paths_classify_as_api(stem in "[a-z]{1,10}") {
        // Passthrough prefixes take precedence, everything else is generic
        prop_assume!(!stem.starts_with("auth") && !stem.starts_with("realtime"));
        prop_assume!(stem != "bulk");

        let rules = ClassifierRules::default();
        let url = format!("https://ops.example.com/api/{}?page=2", stem);
        let request = SyncRequest::get(&url).unwrap();
        prop_assert_eq!(classify(&rules, &request), RequestClass::Api);
    }
}

// =============================================================================
// Tenant Validation
// =============================================================================

proptest! {
    /// Acceptance exactly matches the documented format, on any input
    #[test]
    fn prop_tenant_format_acceptance(s in ".{0,80}") {
        let expected = !s.is_empty()
            && s.len() <= 50
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        prop_assert_eq!(validate_tenant_id(&s).is_ok(), expected);
    }
}

// =============================================================================
// Namespace Format
// =============================================================================

proptest! {
    /// Display then parse returns the namespace unchanged
    #[test]
    fn prop_namespace_display_parse_roundtrip(
        version in any::<u32>(),
        purpose in purpose_strategy(),
        tenant in valid_tenant_strategy(),
    ) {
        let ns = Namespace::new(version, purpose, tenant);
        let shown = ns.to_string();
        prop_assert_eq!(Namespace::parse(&shown), Some(ns));
    }

    /// Parsing arbitrary strings never panics, and anything it accepts
    /// survives a display/parse cycle
    #[test]
    fn fuzz_namespace_parse_on_arbitrary_strings(s in ".{0,60}") {
        if let Some(ns) = Namespace::parse(&s) {
            let shown = ns.to_string();
            prop_assert_eq!(Namespace::parse(&shown), Some(ns));
        }
    }
}

// =============================================================================
// Outbox Attempt Budget
// =============================================================================

proptest! {
    /// Attempts only ever count up; the record turns Failed exactly at the
    /// cap and a manual retry restores a clean budget
    #[test]
    fn prop_attempt_cap_monotonic(cap in 1u32..8, failures in 1usize..20) {
        let request = SyncRequest::new(
            HttpMethod::Put,
            "https://ops.example.com/api/workitems/7/status",
        )
        .unwrap();
        let mut mutation = QueuedMutation::new("acme", &request);

        for i in 1..=failures {
            let now_permanent = mutation.record_failure("HTTP 500", cap);
            prop_assert_eq!(mutation.attempt_count, i as u32);
            prop_assert_eq!(now_permanent, i as u32 >= cap);
            prop_assert_eq!(mutation.state == MutationState::Failed, i as u32 >= cap);
        }

        mutation.reset_for_retry();
        prop_assert_eq!(mutation.attempt_count, 0);
        prop_assert_eq!(mutation.state, MutationState::Pending);
        prop_assert!(mutation.last_error.is_none());
    }

    /// Entity references come out of any URL shape without panicking
    #[test]
    fn fuzz_entity_ref_on_arbitrary_urls(url in ".{0,100}") {
        let mutation = QueuedMutation {
            id: "m-1".to_string(),
            tenant: "acme".to_string(),
            method: HttpMethod::Put,
            url,
            payload: None,
            enqueued_at_ms: 0,
            attempt_count: 0,
            last_error: None,
            state: MutationState::Pending,
        };
        let (kind, id) = mutation.entity_ref();
        prop_assert!(!kind.is_empty());
        prop_assert!(!id.is_empty());
    }
}

// =============================================================================
// Response Bodies and Compression
// =============================================================================

proptest! {
    /// JSON extraction on arbitrary bytes fails cleanly, never panics
    #[test]
    fn fuzz_response_json_on_arbitrary_bytes(
        bytes in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let response = SyncResponse::new(
            200,
            Some("application/json".to_string()),
            Bytes::from(bytes),
        );
        let _ = response.json();
    }

    /// Compress then decompress is the identity for anything that does not
    /// already carry the zstd magic
    #[test]
    fn prop_compress_roundtrip_arbitrary_bytes(
        data in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        prop_assume!(!is_zstd_compressed(&data));
        let stored = maybe_compress(&data);
        let restored = maybe_decompress(&stored).unwrap();
        prop_assert_eq!(restored, data);
    }

    /// Repetitive bodies over the floor actually shrink, and still restore
    #[test]
    fn prop_compressible_bodies_shrink(byte in any::<u8>(), len in 256usize..2048) {
        let data = vec![byte; len];
        let stored = maybe_compress(&data);
        prop_assert!(stored.len() < data.len());
        prop_assert_eq!(maybe_decompress(&stored).unwrap(), data);
    }
}

// =============================================================================
// Cache Key Normalization
// =============================================================================

proptest! {
    /// Parameter order and the tenant parameter never change the cache key
    #[test]
    fn prop_cache_key_ignores_pair_order_and_tenant(
        pairs in query_pairs_strategy(),
        tenant in valid_tenant_strategy(),
    ) {
        let forward: Vec<String> =
            pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let reverse: Vec<String> =
            pairs.iter().rev().map(|(k, v)| format!("{}={}", k, v)).collect();

        let plain = format!(
            "https://ops.example.com/api/workitems?{}",
            forward.join("&")
        );
        let scoped = format!(
            "https://ops.example.com/api/workitems?tenant={}&{}",
            tenant,
            reverse.join("&")
        );

        let first = SyncRequest::get(&plain).unwrap();
        let second = SyncRequest::get(&scoped).unwrap();
        prop_assert_eq!(first.cache_key(), second.cache_key());
    }
}
