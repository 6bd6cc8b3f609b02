//! Property-based checks over the generator, lifecycle state machine,
//! offset registry, result upserts, and pagination cursors

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use proptest::prelude::*;

use prospector_engine::lifecycle::{transition, Command};
use prospector_engine::model::{
    CounterDelta, DnsErrorKind, DnsResult, GeneratedDomain, NewCampaign, Phase, PhaseStatus,
    ProbeStatus,
};
use prospector_engine::pattern::{PatternSpec, PatternType};
use prospector_engine::store::memory::MemoryStore;
use prospector_engine::store::EngineStore;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime builds")
}

fn pattern_type_strategy() -> impl Strategy<Value = PatternType> {
    prop::sample::select(vec![PatternType::Prefix, PatternType::Suffix, PatternType::Both])
}

fn charset_strategy() -> impl Strategy<Value = String> {
    // Unique characters, per the spec's validation rule.
    prop::sample::subsequence("abcdefghijklmnopqrstuvwxyz0123456789".chars().collect::<Vec<_>>(), 1..=8)
        .prop_map(|chars| chars.into_iter().collect())
}

fn command_strategy() -> impl Strategy<Value = Command> {
    let phases = || prop::sample::select(Phase::ALL.to_vec());
    prop_oneof![
        phases().prop_map(Command::Configure),
        phases().prop_map(Command::Start),
        Just(Command::Pause),
        Just(Command::Resume),
        Just(Command::Cancel),
        Just(Command::Retry),
        Just(Command::Complete),
        Just(Command::Fail),
    ]
}

/// The `(phase, status)` product the lifecycle table admits:
/// `not_started` exists only in generation, `ready` only downstream.
fn is_legal_pair(phase: Phase, status: PhaseStatus) -> bool {
    match status {
        PhaseStatus::NotStarted => phase == Phase::Generation,
        PhaseStatus::Ready => phase != Phase::Generation,
        _ => true,
    }
}

fn spec_strategy() -> impl Strategy<Value = PatternSpec> {
    (
        pattern_type_strategy(),
        1u32..=4,
        charset_strategy(),
        "[a-z]{0,5}",
        prop::sample::select(vec!["com", "net", "org", "io"]),
    )
        .prop_map(|(pattern_type, variable_length, character_set, constant_string, tld)| {
            PatternSpec {
                pattern_type,
                variable_length,
                character_set,
                constant_string,
                tld: tld.to_string(),
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn generator_is_pure_and_injective(spec in spec_strategy(), raw_a in 0u64..10_000, raw_b in 0u64..10_000) {
        let total = spec.total_combinations().to_u64().unwrap();
        let a = BigUint::from(raw_a % total);
        let b = BigUint::from(raw_b % total);

        // Pure: repeated evaluation agrees.
        prop_assert_eq!(spec.domain_at(&a).unwrap(), spec.domain_at(&a).unwrap());

        // Injective within the space: distinct offsets yield distinct names.
        if a != b {
            prop_assert_ne!(spec.domain_at(&a).unwrap(), spec.domain_at(&b).unwrap());
        }
    }

    #[test]
    fn lifecycle_walks_stay_inside_the_legal_table(
        commands in prop::collection::vec(command_strategy(), 1..64),
        created_configured in any::<bool>(),
    ) {
        // Both documented entry states: the command-table create state and
        // the bare not-started one.
        let mut phase = Phase::Generation;
        let mut status = if created_configured {
            PhaseStatus::Configured
        } else {
            PhaseStatus::NotStarted
        };

        for command in commands {
            let before = (phase, status);
            match transition(phase, status, command) {
                Ok((next_phase, next_status)) => {
                    prop_assert!(
                        is_legal_pair(next_phase, next_status),
                        "{} moved ({}, {}) to illegal ({}, {})",
                        command, before.0, before.1, next_phase, next_status
                    );
                    // Phases never move backwards or skip ahead.
                    prop_assert!(
                        next_phase == phase || phase.next() == Some(next_phase),
                        "{} jumped from {} to {}",
                        command, phase, next_phase
                    );
                    if command == Command::Cancel {
                        match before.1 {
                            PhaseStatus::Configured
                            | PhaseStatus::InProgress
                            | PhaseStatus::Paused => {
                                prop_assert_eq!(next_status, PhaseStatus::Cancelled);
                            }
                            // Terminal pairs observe themselves.
                            PhaseStatus::Completed
                            | PhaseStatus::Cancelled
                            | PhaseStatus::Failed => {
                                prop_assert_eq!((next_phase, next_status), before);
                            }
                            PhaseStatus::NotStarted | PhaseStatus::Ready => {
                                prop_assert!(
                                    false,
                                    "cancel accepted from ({}, {})",
                                    before.0, before.1
                                );
                            }
                        }
                    }
                    phase = next_phase;
                    status = next_status;
                }
                Err(e) => {
                    // Rejected commands surface as InvalidState and leave
                    // the observed pair untouched.
                    prop_assert!(
                        matches!(e, prospector_engine::error::Error::InvalidState(_)),
                        "{} failed with unexpected error: {}",
                        command, e
                    );
                }
            }
        }
    }

    #[test]
    fn fingerprint_is_stable_and_field_sensitive(spec in spec_strategy()) {
        prop_assert_eq!(spec.fingerprint(), spec.clone().fingerprint());

        let mut longer = spec.clone();
        longer.variable_length += 1;
        prop_assert_ne!(spec.fingerprint(), longer.fingerprint());

        let mut other_tld = spec.clone();
        other_tld.tld = format!("{}x", spec.tld);
        prop_assert_ne!(spec.fingerprint(), other_tld.fingerprint());

        let mut other_constant = spec.clone();
        other_constant.constant_string = format!("{}q", spec.constant_string);
        prop_assert_ne!(spec.fingerprint(), other_constant.fingerprint());
    }

    #[test]
    fn reservations_are_gapless_and_monotonic(counts in prop::collection::vec(1u64..500, 1..12)) {
        runtime().block_on(async {
            let store = MemoryStore::new();
            let fingerprint = "fp-properties";
            let mut expected = BigUint::from(0u32);

            for count in &counts {
                let reservation = store.reserve_offsets(fingerprint, *count).await.unwrap();
                // Each range starts exactly where the previous one ended.
                assert_eq!(reservation.start, expected);
                assert_eq!(reservation.len(), BigUint::from(*count));
                expected = reservation.end.clone();
            }

            let total: u64 = counts.iter().sum();
            assert_eq!(store.peek_offset(fingerprint).await.unwrap(), BigUint::from(total));
        });
    }

    #[test]
    fn result_upserts_converge_to_last_write(outcomes in prop::collection::vec(any::<bool>(), 1..10)) {
        runtime().block_on(async {
            let store = MemoryStore::new();
            let campaign = store
                .create_campaign(NewCampaign {
                    name: "prop".to_string(),
                    owner_id: "user-a".to_string(),
                    pattern: PatternSpec {
                        pattern_type: PatternType::Prefix,
                        variable_length: 2,
                        character_set: "ab".to_string(),
                        constant_string: String::new(),
                        tld: "com".to_string(),
                    },
                    requested_count: 1,
                })
                .await
                .unwrap();
            store
                .insert_generated(vec![GeneratedDomain {
                    campaign_id: campaign.id,
                    global_offset: 0,
                    domain_name: "aa.com".to_string(),
                    created_at: chrono::Utc::now(),
                }])
                .await
                .unwrap();

            for ok in &outcomes {
                store
                    .upsert_dns_result(DnsResult {
                        campaign_id: campaign.id,
                        domain_name: "aa.com".to_string(),
                        persona_id: uuid::Uuid::nil(),
                        status: if *ok { ProbeStatus::Ok } else { ProbeStatus::Failed },
                        resolved_addresses: vec![],
                        error_kind: (!ok).then_some(DnsErrorKind::Timeout),
                        attempts: 0,
                        last_checked_at: chrono::Utc::now(),
                    })
                    .await
                    .unwrap();
            }

            // Row count pinned at one, last write wins, attempts accumulate.
            assert_eq!(store.count_dns_results(campaign.id, None).await.unwrap(), 1);
            let page = store.list_dns_results(campaign.id, 10, None).await.unwrap();
            let expected_status = if *outcomes.last().unwrap() {
                ProbeStatus::Ok
            } else {
                ProbeStatus::Failed
            };
            assert_eq!(page.items[0].status, expected_status);
            assert_eq!(page.items[0].attempts as usize, outcomes.len());
        });
    }

    #[test]
    fn cursor_pagination_is_exhaustive_and_ordered(
        row_count in 1usize..120,
        page_size in 1usize..40,
    ) {
        runtime().block_on(async {
            let store = MemoryStore::new();
            let campaign = store
                .create_campaign(NewCampaign {
                    name: "pages".to_string(),
                    owner_id: "user-a".to_string(),
                    pattern: PatternSpec {
                        pattern_type: PatternType::Prefix,
                        variable_length: 4,
                        character_set: "abcdefghij".to_string(),
                        constant_string: String::new(),
                        tld: "com".to_string(),
                    },
                    requested_count: row_count as u64,
                })
                .await
                .unwrap();
            let rows: Vec<GeneratedDomain> = (0..row_count)
                .map(|i| GeneratedDomain {
                    campaign_id: campaign.id,
                    global_offset: (i * 3) as u64,
                    domain_name: format!("d{i:04}.com"),
                    created_at: chrono::Utc::now(),
                })
                .collect();
            store.insert_generated(rows).await.unwrap();

            let mut seen = Vec::new();
            let mut cursor: Option<String> = None;
            loop {
                let page = store
                    .list_generated(campaign.id, page_size, cursor.as_deref())
                    .await
                    .unwrap();
                seen.extend(page.items.iter().map(|r| r.global_offset));
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }

            // Every row exactly once, in a stable order.
            let expected: Vec<u64> = (0..row_count).map(|i| (i * 3) as u64).collect();
            assert_eq!(seen, expected);
        });
    }

    #[test]
    fn counter_deltas_accumulate(outcomes in prop::collection::vec(any::<bool>(), 1..30)) {
        runtime().block_on(async {
            let store = MemoryStore::new();
            let campaign = store
                .create_campaign(NewCampaign {
                    name: "counters".to_string(),
                    owner_id: "user-a".to_string(),
                    pattern: PatternSpec {
                        pattern_type: PatternType::Prefix,
                        variable_length: 2,
                        character_set: "ab".to_string(),
                        constant_string: String::new(),
                        tld: "com".to_string(),
                    },
                    requested_count: 1,
                })
                .await
                .unwrap();
            store
                .set_phase_total(campaign.id, Phase::DnsValidation, outcomes.len() as u64)
                .await
                .unwrap();

            for ok in &outcomes {
                store
                    .bump_counters(campaign.id, Phase::DnsValidation, CounterDelta::one(*ok))
                    .await
                    .unwrap();
            }

            let refreshed = store.get_campaign(campaign.id).await.unwrap().unwrap();
            let counters = refreshed.phase_counters(Phase::DnsValidation);
            let succeeded = outcomes.iter().filter(|ok| **ok).count() as u64;
            assert_eq!(counters.processed, outcomes.len() as u64);
            assert_eq!(counters.succeeded, succeeded);
            assert_eq!(counters.failed, outcomes.len() as u64 - succeeded);
        });
    }
}
