use axum::http::HeaderMap;
use opalcache::core::keygen::{KeyGenerator, normalize_query};
use proptest::prelude::*;

fn query_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("[a-z]{1,6}", "[a-z0-9 ]{0,8}"), 0..6)
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

proptest! {
    #[test]
    fn keys_are_always_64_lowercase_hex(
        host in "[a-zA-Z0-9.]{1,20}",
        path in "/[a-zA-Z0-9/._-]{0,30}",
        pairs in query_pairs(),
    ) {
        let keygen = KeyGenerator::default();
        let query = encode_pairs(&pairs);
        let key = keygen.key("http", &host, &path, Some(&query), &HeaderMap::new());
        prop_assert_eq!(key.len(), 64);
        prop_assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn key_is_insensitive_to_query_pair_order(
        (pairs, shuffled) in query_pairs().prop_flat_map(|pairs| {
            let shuffled = Just(pairs.clone()).prop_shuffle();
            (Just(pairs), shuffled)
        }),
    ) {
        let keygen = KeyGenerator::default();
        let headers = HeaderMap::new();
        let k1 = keygen.key("http", "example.com", "/p", Some(&encode_pairs(&pairs)), &headers);
        let k2 = keygen.key("http", "example.com", "/p", Some(&encode_pairs(&shuffled)), &headers);
        prop_assert_eq!(k1, k2);
    }

    #[test]
    fn normalize_query_is_idempotent(pairs in query_pairs()) {
        let raw = encode_pairs(&pairs);
        let once = normalize_query(&raw);
        let twice = normalize_query(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn distinct_paths_produce_distinct_keys(
        a in "/[a-z]{1,12}",
        b in "/[a-z]{1,12}",
    ) {
        prop_assume!(a != b);
        let keygen = KeyGenerator::default();
        let headers = HeaderMap::new();
        let k1 = keygen.key("http", "example.com", &a, None, &headers);
        let k2 = keygen.key("http", "example.com", &b, None, &headers);
        prop_assert_ne!(k1, k2);
    }
}
