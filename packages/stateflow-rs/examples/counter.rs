// Counter demo: a named store, a logging function object and an async effect

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stateflow::{
    Action, Capabilities, Dispatcher, DispatcherConfig, ExecuteAction, FunctionObject,
    PayloadAction, StoreBuilder, StoreKey, Subscribe,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq)]
struct Counter {
    value: i64,
    saved: i64,
}

#[derive(Debug, Default)]
struct Increment;
impl Action for Increment {}

#[derive(Debug, Default)]
struct Add {
    amount: i64,
}
impl Action for Add {}
impl PayloadAction for Add {
    type Payload = i64;

    fn set_payload(&mut self, amount: i64) {
        self.amount = amount;
    }
}

#[derive(Debug, Default)]
struct Saved {
    value: i64,
}
impl Action for Saved {}

/// Logs every increment and every counter transition.
struct Audit;

impl ExecuteAction<Increment> for Audit {
    fn execute(&self, _: &Increment, dispatcher: &Dispatcher) -> Result<()> {
        tracing::info!(queued = dispatcher.pending_len(), "increment applied");
        Ok(())
    }
}

impl Subscribe<Counter> for Audit {
    fn on_update(&self, store: Option<&str>, old: &Counter, new: &Counter) {
        tracing::info!(store = ?store, old = old.value, new = new.value, "counter changed");
    }
}

impl FunctionObject for Audit {
    fn capabilities(self: Arc<Self>, caps: &mut Capabilities) {
        caps.execute_action::<Increment>(self.clone())
            .subscribe::<Counter>(self);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stateflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DispatcherConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(?config, "configuration loaded");

    let dispatcher = Dispatcher::builder()
        .with_config(config)
        .with_store(
            StoreBuilder::new(Counter { value: 0, saved: 0 })
                .named("counter")
                .reducer(|c: &Counter, _: &Increment| Counter {
                    value: c.value + 1,
                    ..c.clone()
                })
                .reducer(|c: &Counter, a: &Add| Counter {
                    value: c.value + a.amount,
                    ..c.clone()
                })
                .reducer(|c: &Counter, a: &Saved| Counter {
                    saved: a.value,
                    ..c.clone()
                })
                .validate(|_, next: Counter| Counter {
                    value: next.value.clamp(-1000, 1000),
                    ..next
                }),
        )
        .with_functions(Arc::new(Audit))
        .build()
        .context("Failed to build dispatcher")?;

    // Pretend to persist every value, then report back
    let counter = dispatcher.get_state::<Counter>(StoreKey::Name("counter"))?;
    let _persist = dispatcher.register_execute_action_async::<Add, _, _>(move |_, d| {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let value = counter.get()?.value;
            tracing::info!(value, "persisted");
            d.dispatch_with::<Saved>(|saved| saved.value = value)?;
            Ok(())
        }
    });

    dispatcher.dispatch::<Increment>()?;
    dispatcher.dispatch::<Increment>()?;
    dispatcher.dispatch_payload::<Add>(40)?;
    dispatcher.dispatch_payload::<Add>(5000)?;

    dispatcher
        .wait_idle_timeout(Duration::from_secs(5))
        .await
        .context("Async effects did not settle")?;

    for state in &dispatcher.get_states() {
        tracing::info!(id = %state.id(), name = ?state.name(), state = state.state_type_name(), "store");
    }

    let counter = dispatcher.get_state::<Counter>(StoreKey::Type)?.get()?;
    tracing::info!(value = counter.value, saved = counter.saved, "done");
    Ok(())
}
