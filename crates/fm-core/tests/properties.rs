use fm_core::{
    ContentRecord, Coord3, FeedbackSignal, FieldMemory, FieldMemoryConfig, ManualClock, QueryContext, QueryKind,
    QueryRequest, SpaceBounds,
};
use proptest::prelude::*;

fn memory(seed: u64) -> FieldMemory {
    let config = FieldMemoryConfig {
        seed: Some(seed),
        ..Default::default()
    };
    FieldMemory::with_clock(config, Box::new(ManualClock::new(0))).unwrap()
}

fn coord() -> impl Strategy<Value = Coord3> {
    (-5.0f64..5.0, -5.0f64..5.0, -5.0f64..5.0).prop_map(|(x, y, z)| Coord3::new(x, y, z))
}

fn kind() -> impl Strategy<Value = QueryKind> {
    prop_oneof![
        Just(QueryKind::Precision),
        Just(QueryKind::Discovery),
        Just(QueryKind::Hybrid),
        Just(QueryKind::Auto),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever is stored, queried and fed back, every node stays inside
    /// the space with confidence and resonance in [0, 1].
    #[test]
    fn nodes_stay_in_bounds(
        seed in any::<u64>(),
        points in prop::collection::vec((coord(), -1.0f64..2.0), 1..20),
        queries in prop::collection::vec((kind(), 0.0f64..=1.0, 0.0f64..=1.0), 1..8),
        boost in any::<bool>(),
    ) {
        let mut fm = memory(seed);
        for (i, (at, confidence)) in points.iter().enumerate() {
            let category = if i % 2 == 0 { "even" } else { "odd" };
            let record = ContentRecord::new(format!("n{i}"), category, "point")
                .with_coordinates(*at)
                .with_confidence(*confidence);
            fm.store(record).unwrap();
        }

        let mut ctx = QueryContext::default();
        for (kind, confidence, exploration) in queries {
            let request = QueryRequest {
                kind,
                confidence,
                exploration,
                ..QueryRequest::for_category("even")
            };
            let resp = fm.query(request, &mut ctx).unwrap();
            prop_assert!((0.0..=1.0).contains(&resp.coherence_level));
            prop_assert!(resp.memories.len() <= 10);
            let ids: Vec<String> = resp.ids().into_iter().map(str::to_string).collect();
            let signal = if boost { FeedbackSignal::Boost } else { FeedbackSignal::Demote };
            fm.apply_feedback(&ids, signal);
        }

        let bounds = SpaceBounds::default();
        for node in fm.store_ref().iter() {
            prop_assert!(bounds.contains(node.coordinates));
            prop_assert!((0.0..=1.0).contains(&node.confidence()));
            prop_assert!((0.0..=1.0).contains(&node.resonance()));
        }
        prop_assert!(fm.store_ref().is_consistent());
    }

    /// Precision results are sorted by confidence, best first.
    #[test]
    fn precision_is_sorted(confidences in prop::collection::vec(0.0f64..=1.0, 1..15)) {
        let mut fm = memory(1);
        for (i, c) in confidences.iter().enumerate() {
            fm.store(ContentRecord::new(format!("n{i:02}"), "c", "item").with_confidence(*c)).unwrap();
        }
        let mut ctx = QueryContext::default();
        let resp = fm.query(QueryRequest::precision("c", 0.9), &mut ctx).unwrap();
        let got: Vec<f64> = resp.memories.iter().map(|n| n.confidence()).collect();
        prop_assert!(got.windows(2).all(|w| w[0] >= w[1]));
    }
}
