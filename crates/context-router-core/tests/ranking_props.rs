use std::sync::Arc;

use context_router_core::chunk::make_chunk;
use context_router_core::models::{CandidateResult, ChunkStructure, ContentType, Query, StrategyKind};
use context_router_core::profile::ProfileRegistry;
use context_router_core::ranker::{rank, RankingModelState};
use proptest::prelude::*;

const PROFILES: &[&str] = &[
    "unclassified",
    "code-completion",
    "code-review",
    "documentation",
    "devops",
    "conversation",
];

fn content_type() -> impl Strategy<Value = ContentType> {
    prop::sample::select(ContentType::ALL.to_vec())
}

fn candidate() -> impl Strategy<Value = CandidateResult> {
    (
        "[a-z_ ]{1,120}",
        content_type(),
        0.0f64..1.0,
        prop::option::of(0.0f64..1.0),
        any::<bool>(),
        0usize..1000,
    )
        .prop_map(|(text, t, merged, vector, symbol, index)| {
            let structure = symbol.then(|| ChunkStructure::Symbol {
                symbol_kind: "function".into(),
                name: text.split(' ').next().unwrap_or_default().to_string(),
                start_line: 1,
                end_line: 2,
            });
            let chunk = make_chunk("p", index, t, StrategyKind::SemanticFunction, &text, structure);
            CandidateResult {
                chunk: Arc::new(chunk),
                vector_score: vector,
                keyword_score: None,
                merged_score: merged,
                final_score: merged,
                rank: 0,
            }
        })
}

fn model_state() -> impl Strategy<Value = RankingModelState> {
    (0.1f64..2.0, prop::collection::btree_map("[a-z_:]{3,20}", 0.0f64..5.0, 0..4)).prop_map(
        |(retrieval_weight, feature_weights)| RankingModelState {
            retrieval_weight,
            feature_weights,
            ..RankingModelState::initial()
        },
    )
}

proptest! {
    #[test]
    fn rank_never_exceeds_the_window(
        candidates in prop::collection::vec(candidate(), 0..60),
        profile_id in prop::sample::select(PROFILES.to_vec()),
        text in "[a-z_ ]{1,40}",
        model in model_state(),
    ) {
        let profile = ProfileRegistry::with_builtins().get(profile_id);
        let n = candidates.len();
        let out = rank(candidates, &Query::new(text, None), &profile, &model);
        prop_assert!(out.len() <= profile.context_window.max_chunks);
        prop_assert!(out.len() <= n);
        if n > 0 {
            prop_assert!(!out.is_empty());
        }
        for (i, c) in out.iter().enumerate() {
            prop_assert_eq!(c.rank, i + 1);
        }
        for pair in out.windows(2) {
            prop_assert!(pair[0].final_score >= pair[1].final_score);
        }
    }

    #[test]
    fn rank_is_deterministic_and_order_independent(
        candidates in prop::collection::vec(candidate(), 0..40),
        profile_id in prop::sample::select(PROFILES.to_vec()),
        text in "[a-z_ ]{1,40}",
        model in model_state(),
    ) {
        let profile = ProfileRegistry::with_builtins().get(profile_id);
        let query = Query::new(text, None);
        let ids = |v: Vec<CandidateResult>| {
            v.into_iter().map(|c| c.chunk.id.clone()).collect::<Vec<_>>()
        };

        let mut reversed = candidates.clone();
        reversed.reverse();
        let a = ids(rank(candidates.clone(), &query, &profile, &model));
        let b = ids(rank(candidates, &query, &profile, &model));
        let c = ids(rank(reversed, &query, &profile, &model));
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a, c);
    }
}
