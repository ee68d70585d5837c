#[cfg(test)]
mod property_tests {
    use crate::core::firewall::{Action, ConnectionEvent, Direction, PortEntry, Protocol, Rule};
    use crate::core::matcher::{CompiledRule, RuleSet, evaluate};
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};

    const APPS: [&str; 4] = [
        "/usr/bin/curl",
        "/usr/bin/telnet",
        "/usr/lib/firefox/firefox",
        "/opt/tools/sync",
    ];

    fn arb_protocol() -> impl Strategy<Value = Protocol> {
        prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp), Just(Protocol::Icmp)]
    }

    fn arb_direction() -> impl Strategy<Value = Direction> {
        prop_oneof![Just(Direction::Inbound), Just(Direction::Outbound)]
    }

    fn arb_action() -> impl Strategy<Value = Action> {
        prop_oneof![Just(Action::Allow), Just(Action::Block)]
    }

    prop_compose! {
        fn arb_port_entry()(start in 1u16..=1024, len in 0u16..64, single in any::<bool>()) -> PortEntry {
            if single {
                PortEntry::Single(start)
            } else {
                PortEntry::range(start, start.saturating_add(len))
            }
        }
    }

    prop_compose! {
        fn arb_event()(
            app in prop::sample::select(APPS.to_vec()),
            protocol in arb_protocol(),
            direction in arb_direction(),
            src_port in 1u16..=1100,
            dst_port in 1u16..=1100,
        ) -> ConnectionEvent {
            ConnectionEvent::new(app, protocol, direction)
                .with_source(IpAddr::V4(Ipv4Addr::LOCALHOST), src_port)
                .with_destination(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), dst_port)
        }
    }

    prop_compose! {
        fn arb_rule()(
            application in prop_oneof![
                prop::sample::select(APPS.to_vec()).prop_map(str::to_string),
                Just("*".to_string()),
                Just("/usr/bin/*".to_string()),
            ],
            action in arb_action(),
            protocol in prop_oneof![Just(Protocol::Any), arb_protocol()],
            ports in prop::collection::vec(arb_port_entry(), 0..3),
            direction in proptest::option::of(arb_direction()),
        ) -> Rule {
            let mut rule = Rule::new("placeholder", application, action)
                .with_protocol(protocol)
                .with_ports(ports);
            rule.direction = direction;
            rule
        }
    }

    fn named(rules: Vec<Rule>) -> Vec<Rule> {
        rules
            .into_iter()
            .enumerate()
            .map(|(i, mut r)| {
                r.name = format!("r{i}");
                r
            })
            .collect()
    }

    proptest! {
        #[test]
        fn test_evaluation_is_deterministic(
            rules in prop::collection::vec(arb_rule(), 0..12),
            event in arb_event(),
            default in arb_action(),
        ) {
            let set = RuleSet::compile("P", 1, named(rules));
            let first = set.evaluate(&event, default);
            let second = set.evaluate(&event, default);
            prop_assert_eq!(&first, &second);

            // A fresh compile of the same rules agrees too
            let again = RuleSet::compile("P", 2, set.rules().cloned().collect::<Vec<_>>());
            prop_assert_eq!(first, again.evaluate(&event, default));
        }

        #[test]
        fn test_first_matching_rule_wins(
            rules in prop::collection::vec(arb_rule(), 0..12),
            event in arb_event(),
            default in arb_action(),
        ) {
            let compiled: Vec<CompiledRule> =
                named(rules).into_iter().map(CompiledRule::compile).collect();
            let verdict = evaluate(&event, &compiled, default);

            match compiled.iter().find(|r| r.matches(&event)) {
                Some(first) => {
                    prop_assert_eq!(&verdict.rule_name, &first.rule().name);
                    prop_assert_eq!(verdict.action, first.rule().action);
                }
                None => {
                    prop_assert_eq!(verdict.rule_name, "");
                    prop_assert_eq!(verdict.action, default);
                }
            }
        }

        #[test]
        fn test_catch_all_prefix_shadows_everything(
            rules in prop::collection::vec(arb_rule(), 0..12),
            event in arb_event(),
            action in arb_action(),
        ) {
            let mut all = vec![Rule::new("catch-all", "*", action)];
            all.extend(named(rules));
            let verdict = RuleSet::compile("P", 1, all).evaluate(&event, Action::Block);
            prop_assert_eq!(verdict.rule_name, "catch-all");
            prop_assert_eq!(verdict.action, action);
        }

        #[test]
        fn test_empty_rule_set_uses_default(event in arb_event(), default in arb_action()) {
            let verdict = RuleSet::empty().evaluate(&event, default);
            prop_assert_eq!(verdict.action, default);
            prop_assert!(verdict.rule_name.is_empty());
        }
    }
}

#[cfg(test)]
mod concurrency_tests {
    use crate::config::EngineConfig;
    use crate::core::engine::Engine;
    use crate::core::filter::Filter;
    use crate::core::firewall::{Action, Protocol};
    use crate::core::stats::StatsAggregator;
    use crate::core::test_helpers::{inbound, outbound, pipeline_with, rule};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_profile_switch_is_never_torn() {
        let (pipeline, _, store) = pipeline_with(vec![]).await;
        for profile in ["Alpha", "Beta"] {
            store.create_profile(profile, "").await.unwrap();
            for i in 0..5 {
                let name = format!("{}-{i}", profile.to_lowercase());
                store
                    .add_rule(profile, rule(&name, "*", Action::Allow))
                    .await
                    .unwrap();
            }
        }
        store.set_active("Alpha").await.unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                for i in 0..200 {
                    let next = if i % 2 == 0 { "Beta" } else { "Alpha" };
                    store.set_active(next).await.unwrap();
                    tokio::task::yield_now().await;
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let pipeline = Arc::clone(&pipeline);
            let done = Arc::clone(&done);
            readers.push(tokio::spawn(async move {
                let mut checks = 0u32;
                while !done.load(Ordering::SeqCst) || checks < 10 {
                    let set = store.active_rule_set();
                    let prefix = set.profile().unwrap().to_lowercase();
                    assert_eq!(set.len(), 5);
                    assert!(set.rules().all(|r| r.name.starts_with(&prefix)));

                    let handled = pipeline
                        .handle(outbound("/usr/bin/curl", Protocol::Tcp, 443))
                        .await
                        .unwrap();
                    assert!(
                        handled.entry.rule_name.ends_with("-0"),
                        "first rule of either profile wins, got {}",
                        handled.entry.rule_name
                    );

                    let active = store.list_profiles().await;
                    assert_eq!(active.iter().filter(|p| p.active).count(), 1);
                    checks += 1;
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_log_order_per_handler() {
        let (pipeline, log, _) = pipeline_with(vec![]).await;

        let mut handlers = Vec::new();
        for worker in 0..8u16 {
            let pipeline = Arc::clone(&pipeline);
            handlers.push(tokio::spawn(async move {
                let mut entries = Vec::new();
                for port in 0..50u16 {
                    let handled = pipeline
                        .handle(outbound("/bin/worker", Protocol::Udp, worker * 100 + port))
                        .await
                        .unwrap();
                    entries.push(handled.entry);
                }
                entries
            }));
        }

        for handler in handlers {
            let entries = handler.await.unwrap();
            for pair in entries.windows(2) {
                assert!(pair[0].timestamp <= pair[1].timestamp);
                assert!(pair[0].id < pair[1].id);
            }
        }

        let all: Vec<_> = log.query(Filter::default()).collect();
        assert_eq!(all.len(), 400);
        for pair in all.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stats_rebuild_from_log() {
        let engine = Engine::in_memory(EngineConfig {
            default_policy: Action::Allow,
            stats_bucket_secs: 1,
            log_segment_capacity: 16,
            ..EngineConfig::default()
        })
        .await
        .unwrap();
        engine.profiles.ensure_default().await.unwrap();
        engine
            .profiles
            .add_rule("Default", rule("no-telnet", "/usr/bin/telnet", Action::Block))
            .await
            .unwrap();

        let apps = ["/usr/bin/curl", "/usr/bin/telnet", "/usr/sbin/sshd"];
        let mut workers = Vec::new();
        for seed in 0..6u64 {
            let pipeline = Arc::clone(&engine.pipeline);
            workers.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..40 {
                    let app = apps[rng.random_range(0..apps.len())];
                    let port = rng.random_range(1..=1024);
                    let event = if rng.random_bool(0.5) {
                        outbound(app, Protocol::Tcp, port)
                    } else {
                        inbound(app, Protocol::Udp, port)
                    };
                    let handled = pipeline.handle(event).await.unwrap();
                    if rng.random_bool(0.7) {
                        pipeline
                            .report_traffic(
                                &handled.entry,
                                rng.random_range(0..10_000),
                                rng.random_range(0..100_000),
                            )
                            .await;
                    }
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        let incremental = Arc::clone(&engine.stats);
        let log = Arc::clone(&engine.log);
        engine.shutdown().await.unwrap();

        let rebuilt = StatsAggregator::new(1);
        rebuilt.replay(&log.records());
        assert_eq!(
            rebuilt.query(&Filter::default()),
            incremental.query(&Filter::default())
        );
        assert_eq!(rebuilt.summary().total_connections, 240);
        assert_eq!(rebuilt.summary(), incremental.summary());
    }
}
