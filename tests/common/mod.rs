//! Progs and helpers shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use uuid::Uuid;

use strand::backends::{PostgresBackend, SharedBackend, StrandBackend};
use strand::db;
use strand::failure::HopError;
use strand::prog::{Directive, HopContext, Prog, ProgRegistry};
use strand::runtime::{Dispatcher, DispatcherConfig, Runtime};
use strand::semaphore::SemaphoreKind;
use strand::strand::{Frame, LeaseClaim, NewStrand, StrandId};
use strand::RetryPolicy;

pub fn frame(value: Value) -> Frame {
    value.as_object().cloned().expect("object frame")
}

/// Stand-in for the remote hosts hop handlers act on.
///
/// Creation is keyed by name, so a rerun hop finds the resource it already
/// made instead of making a second one.
#[derive(Clone, Default)]
pub struct FakeCloud {
    inner: Arc<Mutex<FakeCloudState>>,
}

#[derive(Default)]
struct FakeCloudState {
    calls: usize,
    resources: HashMap<String, String>,
    creations: HashSet<String>,
    failures_left: usize,
}

impl FakeCloud {
    pub fn ensure(&self, kind: &str, name: &str) -> Result<String, HopError> {
        let mut state = self.inner.lock().expect("fake cloud poisoned");
        state.calls += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(HopError::transient(format!("{kind} api timed out")));
        }
        let key = format!("{kind}/{name}");
        if let Some(id) = state.resources.get(&key) {
            return Ok(id.clone());
        }
        let id = format!("{kind}-{}", state.resources.len() + 1);
        state.resources.insert(key.clone(), id.clone());
        state.creations.insert(key);
        Ok(id)
    }

    /// Fail the next `n` calls with a timeout.
    pub fn fail_next(&self, n: usize) {
        self.inner.lock().expect("fake cloud poisoned").failures_left = n;
    }

    pub fn calls(&self) -> usize {
        self.inner.lock().expect("fake cloud poisoned").calls
    }

    pub fn created(&self) -> usize {
        self.inner.lock().expect("fake cloud poisoned").creations.len()
    }
}

/// `Subnet`: create the network, then exit with its id.
pub fn subnet_prog(cloud: &FakeCloud) -> Prog {
    let cloud = cloud.clone();
    Prog::builder("Subnet")
        .label("start", |ctx: &mut HopContext| {
            ctx.require_str("location")?;
            Ok(Directive::hop("create"))
        })
        .label("create", move |ctx: &mut HopContext| {
            let name = ctx.require_str("name")?.to_string();
            let id = cloud.ensure("subnet", &name)?;
            ctx.set("id", id);
            Ok(Directive::hop("wait"))
        })
        .label("wait", |ctx: &mut HopContext| {
            Ok(Directive::exit(json!({
                "id": ctx.get("id").cloned().unwrap_or(Value::Null),
                "name": ctx.get("name").cloned().unwrap_or(Value::Null),
            })))
        })
        .edges("start", ["create"])
        .edges("create", ["wait"])
        .build()
        .expect("subnet prog")
}

/// `Cert`: issue a certificate for the load balancer.
pub fn cert_prog(cloud: &FakeCloud) -> Prog {
    let cloud = cloud.clone();
    Prog::builder("Cert")
        .label("start", move |ctx: &mut HopContext| {
            let domain = ctx.require_str("domain")?.to_string();
            let serial = cloud.ensure("cert", &domain)?;
            Ok(Directive::exit(json!({"domain": domain, "serial": serial})))
        })
        .build()
        .expect("cert prog")
}

/// `LoadBalancer`: needs a subnet id, pushes a `Cert` child, exits with both.
pub fn load_balancer_prog(cloud: &FakeCloud) -> Prog {
    let cloud = cloud.clone();
    Prog::builder("LoadBalancer")
        .label("start", |ctx: &mut HopContext| {
            ctx.require_str("private_subnet_id")?;
            let domain = format!("{}.example.com", ctx.require_str("name")?);
            Ok(Directive::push(
                "Cert",
                "start",
                frame(json!({"domain": domain})),
                "cert_ready",
            ))
        })
        .label("cert_ready", move |ctx: &mut HopContext| {
            let cert = ctx
                .take_child_exit()
                .ok_or_else(|| HopError::fatal("cert exit missing"))?;
            let name = ctx.require_str("name")?.to_string();
            let id = cloud.ensure("lb", &name)?;
            Ok(Directive::exit(json!({
                "id": id,
                "name": name,
                "private_subnet_id": ctx.get("private_subnet_id").cloned(),
                "cert": cert,
            })))
        })
        .build()
        .expect("load balancer prog")
}

/// `Provision`: push a subnet, then a load balancer on it.
pub fn provision_prog() -> Prog {
    Prog::builder("Provision")
        .label("start", |ctx: &mut HopContext| {
            let subnet = ctx.get("subnet").cloned().unwrap_or(Value::Null);
            Ok(Directive::push("Subnet", "start", frame(subnet), "subnet_ready"))
        })
        .label("subnet_ready", |ctx: &mut HopContext| {
            let subnet = ctx
                .take_child_exit()
                .ok_or_else(|| HopError::fatal("subnet exit missing"))?;
            let subnet_id = subnet["id"].clone();
            ctx.set("subnet", subnet);
            Ok(Directive::push(
                "LoadBalancer",
                "start",
                frame(json!({"name": "lb-1", "private_subnet_id": subnet_id})),
                "lb_ready",
            ))
        })
        .label("lb_ready", |ctx: &mut HopContext| {
            let lb = ctx
                .take_child_exit()
                .ok_or_else(|| HopError::fatal("load balancer exit missing"))?;
            Ok(Directive::exit(json!({
                "subnet": ctx.get("subnet").cloned(),
                "load_balancer": lb,
            })))
        })
        .build()
        .expect("provision prog")
}

/// `Vm`: parks at `wait`, reacting to `refresh` (flag), `add_disk` (counter)
/// and `destroy` (trigger).
pub fn vm_prog() -> Prog {
    Prog::builder("Vm")
        .label("start", |_: &mut HopContext| Ok(Directive::hop("wait")))
        .label("wait", |ctx: &mut HopContext| {
            if ctx.consume("add_disk") > 0 {
                let disks = ctx.get_as::<u64>("disks").unwrap_or(0);
                ctx.set("disks", disks + 1);
                return Ok(Directive::hop("wait"));
            }
            if ctx.consume("refresh") > 0 {
                let refreshes = ctx.get_as::<u64>("refreshes").unwrap_or(0);
                ctx.set("refreshes", refreshes + 1);
            }
            Ok(Directive::nap_secs(3600))
        })
        .label("destroy", |_: &mut HopContext| {
            Ok(Directive::exit(json!({"destroyed": true})))
        })
        .semaphore("refresh", SemaphoreKind::Flag)
        .semaphore("add_disk", SemaphoreKind::Counter)
        .trigger("destroy", SemaphoreKind::Flag, "destroy")
        .build()
        .expect("vm prog")
}

pub fn registry(cloud: &FakeCloud) -> ProgRegistry {
    let mut registry = ProgRegistry::new();
    for prog in [
        subnet_prog(cloud),
        cert_prog(cloud),
        load_balancer_prog(cloud),
        provision_prog(),
        vm_prog(),
    ] {
        registry.register(prog).expect("register prog");
    }
    registry
}

pub fn dispatcher(backend: SharedBackend, registry: Arc<ProgRegistry>) -> Dispatcher {
    Dispatcher::new(
        backend,
        Runtime::new(registry, RetryPolicy::immediate(3)),
        DispatcherConfig {
            concurrency: 4,
            claim_batch_size: 4,
            ..DispatcherConfig::default()
        },
    )
}

/// Tick until nothing is due at `now`.
pub async fn drain(dispatcher: &Dispatcher, now: DateTime<Utc>) -> usize {
    dispatcher.drain_at(now, 100).await.expect("drain")
}

/// Postgres backend on empty tables, or `None` when `STRAND_DATABASE_URL`
/// is not set.
pub async fn postgres_backend() -> Option<PostgresBackend> {
    let Ok(dsn) = env::var("STRAND_DATABASE_URL") else {
        eprintln!("skipping test: STRAND_DATABASE_URL not set");
        return None;
    };
    let pool = db::connect_pool(&dsn, 16).await.expect("connect");
    db::run_migrations(&pool).await.expect("migrations");
    let backend = PostgresBackend::new(pool);
    backend.clear_all().await.expect("clear tables");
    Some(backend)
}

/// Many workers claim from the same store at once; every strand must be
/// handed to exactly one of them.
pub async fn assert_claims_are_exclusive(backend: SharedBackend) {
    let strands: Vec<NewStrand> = (0..64)
        .map(|_| NewStrand::new("Vm", "start", Frame::new()))
        .collect();
    backend.insert_strands(&strands).await.expect("insert");

    let now = Utc::now();
    let mut workers = JoinSet::new();
    for _ in 0..8 {
        let backend = backend.clone();
        workers.spawn(async move {
            let claim = LeaseClaim::new(Uuid::new_v4(), now, Duration::from_secs(30));
            let mut mine: Vec<StrandId> = Vec::new();
            loop {
                let batch = backend.claim_due_batch(&claim, now, 3).await.expect("claim");
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|claimed| claimed.strand.id));
                tokio::task::yield_now().await;
            }
            mine
        });
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    while let Some(joined) = workers.join_next().await {
        for id in joined.expect("worker") {
            total += 1;
            assert!(seen.insert(id), "strand {id} claimed twice");
        }
    }
    assert_eq!(total, strands.len());

    // Once the leases expire, everything is claimable again, exactly once.
    let later = now + ChronoDuration::seconds(31);
    let claim = LeaseClaim::new(Uuid::new_v4(), later, Duration::from_secs(30));
    let reclaimed = backend
        .claim_due_batch(&claim, later, 100)
        .await
        .expect("reclaim");
    assert_eq!(reclaimed.len(), strands.len());
}
