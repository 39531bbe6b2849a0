//! Stress tests for the drain loop, pools and registrations.
//!
//! These hammer the dispatcher from many threads and tasks with randomized
//! timing, looking for lost actions, wedged drains and reused instances.

#[cfg(test)]
mod stress_tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::action::{Action, PayloadAction};
    use crate::config::DispatcherConfig;
    use crate::dispatcher::Dispatcher;
    use crate::error::StateflowError;
    use crate::registry::StoreKey;
    use crate::store::{StoreBuilder, SubscribeOptions};

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, PartialEq)]
    struct Counter(u64);

    #[derive(Debug, Default)]
    struct Increment;
    impl Action for Increment {}

    #[derive(Debug, Default)]
    struct Chain {
        seq: u64,
        depth: u32,
    }
    impl Action for Chain {}

    #[derive(Debug, Default)]
    struct Token {
        value: u64,
    }
    impl Action for Token {}
    impl PayloadAction for Token {
        type Payload = u64;

        fn set_payload(&mut self, payload: u64) {
            self.value = payload;
        }
    }

    fn counter_dispatcher() -> Dispatcher {
        Dispatcher::builder()
            .with_store(
                StoreBuilder::new(Counter(0))
                    .named("counter")
                    .reducer(|n: &Counter, _: &Increment| Counter(n.0 + 1)),
            )
            .build()
            .unwrap()
    }

    fn count(dispatcher: &Dispatcher) -> u64 {
        dispatcher
            .get_state::<Counter>(StoreKey::Name("counter"))
            .unwrap()
            .get()
            .unwrap()
            .0
    }

    // ==========================================================================
    // Drain Loop
    // ==========================================================================

    #[test]
    fn test_concurrent_dispatch_loses_nothing() {
        let dispatcher = counter_dispatcher();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        let _sub = dispatcher
            .subscribe_with::<Counter, _>(
                StoreKey::Type,
                SubscribeOptions::default().without_initial_call(),
                move |old, new| sink.lock().unwrap().push((old.0, new.0)),
            )
            .unwrap();

        let threads = 8;
        let per_thread = 500;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        dispatcher.dispatch::<Increment>().unwrap();
                        if fastrand::u8(..) < 8 {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total = (threads * per_thread) as u64;
        assert_eq!(count(&dispatcher), total);
        assert!(!dispatcher.is_draining());
        assert_eq!(dispatcher.pending_len(), 0);

        // One drainer at a time: every transition follows the previous one
        let transitions = transitions.lock().unwrap();
        assert_eq!(transitions.len() as u64, total);
        for (i, (old, new)) in transitions.iter().enumerate() {
            assert_eq!(*old, i as u64);
            assert_eq!(*new, i as u64 + 1);
        }
    }

    #[test]
    fn test_random_cascades_run_breadth_first() {
        let dispatcher = Dispatcher::builder().build().unwrap();
        let next_seq = Arc::new(AtomicU64::new(0));
        let processed = Arc::new(Mutex::new(Vec::new()));

        let seq = next_seq.clone();
        let sink = processed.clone();
        let _chain = dispatcher.register_execute_action::<Chain, _>(move |action, d| {
            sink.lock().unwrap().push(action.seq);
            if action.depth == 0 {
                return Ok(());
            }
            for _ in 0..fastrand::u32(0..4) {
                let child_seq = seq.fetch_add(1, Ordering::SeqCst);
                let depth = action.depth - 1;
                d.dispatch_with::<Chain>(|c| {
                    c.seq = child_seq;
                    c.depth = depth;
                })?;
            }
            Ok(())
        });

        for _ in 0..20 {
            let root = next_seq.fetch_add(1, Ordering::SeqCst);
            dispatcher
                .dispatch_with::<Chain>(|c| {
                    c.seq = root;
                    c.depth = 4;
                })
                .unwrap();
        }

        // Submission order is processing order
        let processed = processed.lock().unwrap();
        assert_eq!(processed.len() as u64, next_seq.load(Ordering::SeqCst));
        assert!(processed.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_random_failures_never_wedge_the_drain() {
        let dispatcher = counter_dispatcher();
        let passed = Arc::new(AtomicUsize::new(0));

        let p = passed.clone();
        let _gate = dispatcher.register_pre_action::<Increment, _>(move |_, _| {
            if fastrand::u8(..) < 40 {
                anyhow::bail!("random rejection");
            }
            p.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    let mut failures = 0usize;
                    for _ in 0..300 {
                        if let Err(err) = dispatcher.dispatch::<Increment>() {
                            assert!(err.is_handler_failure());
                            failures += 1;
                        }
                    }
                    failures
                })
            })
            .collect();
        let failures: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(failures > 0);

        // Whatever a failed drain left behind is still runnable
        while dispatcher.pending_len() > 0 {
            let _ = dispatcher.flush();
        }

        assert!(!dispatcher.is_draining());
        assert_eq!(count(&dispatcher), passed.load(Ordering::SeqCst) as u64);
    }

    // ==========================================================================
    // Pools
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_effects_never_see_reused_instances() {
        let dispatcher = Dispatcher::builder()
            .with_config(DispatcherConfig::default().with_pool_capacity(8))
            .build()
            .unwrap();

        for _ in 0..3 {
            dispatcher
                .register_execute_action_async::<Token, _, _>(|action, _| async move {
                    let before = action.value;
                    tokio::time::sleep(Duration::from_micros(fastrand::u64(0..2000))).await;
                    anyhow::ensure!(action.value == before, "instance reused mid-flight");
                    Ok(())
                })
                .leak();
        }

        let mut tasks = Vec::new();
        for worker in 0..4u64 {
            let dispatcher = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..100u64 {
                    dispatcher.dispatch_payload::<Token>(worker * 1000 + i).unwrap();
                    if fastrand::bool() {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        dispatcher
            .wait_idle_timeout(Duration::from_secs(10))
            .await
            .unwrap();
        let idle = dispatcher.pooled_count::<Token>();
        assert!(idle >= 1);
        assert!(idle <= 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_idle_reports_failures_under_load() {
        let dispatcher = Dispatcher::builder().build().unwrap();
        dispatcher
            .register_execute_action_async::<Token, _, _>(|action, _| async move {
                tokio::time::sleep(Duration::from_micros(fastrand::u64(0..500))).await;
                anyhow::ensure!(action.value % 7 != 0, "token {} rejected", action.value);
                Ok(())
            })
            .leak();

        for i in 1..=200u64 {
            dispatcher.dispatch_payload::<Token>(i).unwrap();
        }

        let err = dispatcher
            .wait_idle_timeout(Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StateflowError::AsyncFailed { .. }));
        assert_eq!(dispatcher.running_async(), 0);
    }

    // ==========================================================================
    // Registrations
    // ==========================================================================

    #[test]
    fn test_subscription_churn_during_dispatch() {
        let dispatcher = counter_dispatcher();
        let stop = Arc::new(AtomicUsize::new(0));

        let churners: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    let mut rounds = 0usize;
                    while stop.load(Ordering::SeqCst) == 0 {
                        let registration = dispatcher
                            .subscribe::<Counter, _>(StoreKey::Type, |old, new| {
                                assert!(new.0 == old.0 || new.0 == old.0 + 1);
                            })
                            .unwrap();
                        if fastrand::bool() {
                            std::thread::yield_now();
                        }
                        registration.dispose();
                        rounds += 1;
                    }
                    rounds
                })
            })
            .collect();

        for _ in 0..2000 {
            dispatcher.dispatch::<Increment>().unwrap();
        }
        stop.store(1, Ordering::SeqCst);
        let rounds: usize = churners.into_iter().map(|h| h.join().unwrap()).sum();

        assert!(rounds > 0);
        assert_eq!(count(&dispatcher), 2000);
    }

    #[test]
    fn test_ids_never_cross_dispatchers() {
        let dispatchers: Vec<_> = (0..32).map(|_| counter_dispatcher()).collect();
        let ids: Vec<_> = dispatchers
            .iter()
            .map(|d| d.get_state_id::<Counter>(StoreKey::Type).unwrap())
            .collect();

        for (i, dispatcher) in dispatchers.iter().enumerate() {
            for (j, id) in ids.iter().enumerate() {
                let resolved = dispatcher.try_get_state::<Counter>(StoreKey::Id(*id));
                assert_eq!(resolved.is_some(), i == j);
            }
        }
    }
}
