//! Runs one hop of a claimed strand and turns the result into a transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backends::Transition;
use crate::failure::{HopError, RetryPolicy};
use crate::observability::obs;
use crate::page::NewPage;
use crate::prog::{Directive, FAIL_REASON_KEY, HopContext, HopEffects, Prog, ProgRegistry};
use crate::semaphore::consumption_ids;
use crate::strand::{ClaimedStrand, Link, NewStrand, StrandId, paused_until};

/// What a hop ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopOutcome {
    Hopped { label: String },
    Pushed { child: StrandId },
    Called { prog: String },
    Returned { prog: String },
    Napped { until: DateTime<Utc> },
    Exited,
    Failed { label: String },
    /// A pending semaphore forced the strand to its trigger label.
    Triggered { semaphore: String, label: String },
    Cancelled { label: String },
    Retrying { retry_count: u32, at: DateTime<Utc> },
    /// The strand was halted and a page raised with this kind.
    Halted { kind: &'static str },
}

/// Result of one hop: the state to persist and a summary for logging.
#[derive(Debug, Clone)]
pub struct Executed {
    pub transition: Transition,
    pub outcome: HopOutcome,
}

pub const PAGE_CONFIGURATION: &str = "configuration";
pub const PAGE_FATAL: &str = "fatal";
pub const PAGE_RETRIES_EXHAUSTED: &str = "retries_exhausted";
pub const PAGE_PANIC: &str = "panic";
pub const PAGE_DEADLINE: &str = "deadline";

/// Label dispatch and directive interpretation over a prog registry.
#[derive(Clone)]
pub struct Runtime {
    registry: Arc<ProgRegistry>,
    default_retry: RetryPolicy,
}

impl Runtime {
    pub fn new(registry: Arc<ProgRegistry>, default_retry: RetryPolicy) -> Self {
        Self {
            registry,
            default_retry,
        }
    }

    pub fn registry(&self) -> &Arc<ProgRegistry> {
        &self.registry
    }

    /// Run the strand's current label once.
    ///
    /// Returns `None` when `lease_lost` fires before the handler finishes; the
    /// hop's work is discarded and another worker will rerun it.
    #[obs]
    pub async fn execute(
        &self,
        claimed: &ClaimedStrand,
        now: DateTime<Utc>,
        lease_lost: &CancellationToken,
    ) -> Option<Executed> {
        let strand = &claimed.strand;
        let base = Transition::from_claimed(claimed);

        let Some(prog) = self.registry.get(&strand.prog) else {
            let message = format!("unknown prog {:?}", strand.prog);
            return Some(halt(claimed, base, PAGE_CONFIGURATION, &message, Value::Null, now));
        };
        if !prog.has_label(&strand.label) {
            let message = format!("prog {} has no label {:?}", strand.prog, strand.label);
            return Some(halt(claimed, base, PAGE_CONFIGURATION, &message, Value::Null, now));
        }

        if let Some(deadline) = strand.deadline_at
            && deadline <= now
        {
            return Some(cancel(claimed, &prog, base, deadline, now));
        }

        if let Some(executed) = fire_trigger(claimed, &prog, base.clone(), now) {
            return Some(executed);
        }

        let Some(handler) = prog.handler(&strand.label) else {
            let message = format!("prog {} has no handler for {:?}", strand.prog, strand.label);
            return Some(halt(claimed, base, PAGE_CONFIGURATION, &message, Value::Null, now));
        };
        let mut ctx = HopContext::new(
            strand,
            claimed.semaphores.clone(),
            claimed.children.clone(),
            prog.semaphore_kinds(),
            now,
        );

        let mut task = tokio::spawn(async move {
            let result = handler.run(&mut ctx).await;
            (ctx, result)
        });
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = lease_lost.cancelled() => {
                task.abort();
                warn!(strand_id = %strand.id, label = %strand.label, "lease lost mid-hop; discarding work");
                return None;
            }
        };

        let executed = match joined {
            Ok((ctx, Ok(directive))) => {
                debug!(
                    strand_id = %strand.id,
                    prog = %strand.prog,
                    label = %strand.label,
                    directive = directive.kind(),
                    "hop returned directive"
                );
                match self.apply(claimed, &prog, base.clone(), directive, ctx.into_effects(), now)
                {
                    Ok(executed) => executed,
                    Err(message) => {
                        halt(claimed, base, PAGE_CONFIGURATION, &message, Value::Null, now)
                    }
                }
            }
            Ok((_, Err(HopError::Transient(message)))) => {
                self.retry(claimed, &prog, base, &message, now)
            }
            Ok((_, Err(HopError::Fatal { message, details }))) => {
                halt(claimed, base, PAGE_FATAL, &message, details, now)
            }
            Err(err) if err.is_panic() => {
                let message = panic_message(err.into_panic());
                halt(claimed, base, PAGE_PANIC, &message, Value::Null, now)
            }
            Err(err) => self.retry(claimed, &prog, base, &err.to_string(), now),
        };
        Some(executed)
    }

    fn retry(
        &self,
        claimed: &ClaimedStrand,
        prog: &Prog,
        mut transition: Transition,
        message: &str,
        now: DateTime<Utc>,
    ) -> Executed {
        let strand = &claimed.strand;
        let policy = prog.retry_policy().unwrap_or(&self.default_retry);
        let retry_count = strand.retry_count.saturating_add(1);
        transition.retry_count = retry_count;
        if policy.exhausted(retry_count) {
            let details = json!({"retry_count": retry_count, "max_retries": policy.max_retries});
            let message = format!("retries exhausted after {retry_count} attempts: {message}");
            return halt(claimed, transition, PAGE_RETRIES_EXHAUSTED, &message, details, now);
        }
        let at = after(now, policy.backoff(retry_count));
        warn!(
            strand_id = %strand.id,
            prog = %strand.prog,
            label = %strand.label,
            retry_count,
            error = %message,
            "transient hop failure; retrying"
        );
        transition.scheduled_at = at;
        Executed {
            transition,
            outcome: HopOutcome::Retrying { retry_count, at },
        }
    }

    /// Turn a directive and the hop's buffered effects into a transition.
    /// `Err` carries a configuration error message.
    fn apply(
        &self,
        claimed: &ClaimedStrand,
        prog: &Prog,
        mut transition: Transition,
        directive: Directive,
        effects: HopEffects,
        now: DateTime<Utc>,
    ) -> Result<Executed, String> {
        let strand = &claimed.strand;
        for child in &effects.spawned {
            self.require_label(&child.prog, &child.label)?;
        }

        transition.stack.replace_top(effects.frame);
        transition.consumed_semaphores = effects.consumed;
        transition.spawned = effects.spawned;
        transition.reaped = effects.reaped;
        transition.signals = effects.signals;
        transition.retry_count = 0;
        transition.failed_at = None;
        transition.scheduled_at = now;

        let outcome = match directive {
            Directive::Hop { label, frame } => {
                if !prog.allows_hop(&strand.label, &label) {
                    return Err(format!(
                        "prog {} may not hop from {:?} to {label:?}",
                        prog.name(),
                        strand.label
                    ));
                }
                frame.apply(transition.stack.top_mut());
                transition.label = label.clone();
                HopOutcome::Hopped { label }
            }
            Directive::Push {
                prog: child_prog,
                label,
                frame,
                return_label,
            } => {
                self.require_label(&child_prog, &label)?;
                if !prog.has_label(&return_label) {
                    return Err(format!(
                        "push return label {return_label:?} is not in prog {}",
                        prog.name()
                    ));
                }
                let child = NewStrand::new(child_prog, label, frame).with_parent(strand.id);
                let child_id = child.id;
                transition.spawned.push(child);
                transition.waiting_on = Some(child_id);
                transition.label = return_label;
                HopOutcome::Pushed { child: child_id }
            }
            Directive::Call {
                prog: callee,
                label,
                frame,
                return_label,
            } => {
                self.require_label(&callee, &label)?;
                if !prog.has_label(&return_label) {
                    return Err(format!(
                        "call return label {return_label:?} is not in prog {}",
                        prog.name()
                    ));
                }
                transition.stack.push(
                    frame,
                    Link {
                        prog: prog.name().to_string(),
                        label: return_label,
                    },
                );
                transition.prog = callee.clone();
                transition.label = label;
                HopOutcome::Called { prog: callee }
            }
            Directive::Return(value) => match transition.stack.pop() {
                Some(popped) => {
                    let link = popped
                        .link
                        .ok_or_else(|| "popped frame has no return link".to_string())?;
                    self.require_label(&link.prog, &link.label)?;
                    transition.stack.deliver(value);
                    transition.prog = link.prog.clone();
                    transition.label = link.label;
                    HopOutcome::Returned { prog: link.prog }
                }
                None => {
                    transition.exit = Some(value);
                    HopOutcome::Exited
                }
            },
            Directive::Nap(duration) => {
                let until = after(now, duration);
                transition.scheduled_at = until;
                HopOutcome::Napped { until }
            }
            Directive::Exit(value) => {
                transition.exit = Some(value);
                HopOutcome::Exited
            }
            Directive::Fail(reason) => {
                let fail_label = match prog.fail_label() {
                    Some(label) if label != strand.label => label.to_string(),
                    Some(label) => {
                        return Err(format!(
                            "fail at fail label {label:?} of prog {}: {reason}",
                            prog.name()
                        ));
                    }
                    None => {
                        return Err(format!(
                            "prog {} declares no fail label: {reason}",
                            prog.name()
                        ));
                    }
                };
                transition
                    .stack
                    .top_mut()
                    .insert(FAIL_REASON_KEY.to_string(), Value::String(reason));
                transition.label = fail_label.clone();
                HopOutcome::Failed { label: fail_label }
            }
        };

        Ok(Executed {
            transition,
            outcome,
        })
    }

    fn require_label(&self, prog: &str, label: &str) -> Result<(), String> {
        match self.registry.get(prog) {
            None => Err(format!("unknown prog {prog:?}")),
            Some(found) if !found.has_label(label) => {
                Err(format!("prog {prog} has no label {label:?}"))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Force the strand to the first trigger label whose semaphore is pending.
fn fire_trigger(
    claimed: &ClaimedStrand,
    prog: &Prog,
    mut transition: Transition,
    now: DateTime<Utc>,
) -> Option<Executed> {
    let strand = &claimed.strand;
    for decl in prog.semaphores() {
        let Some(trigger) = &decl.trigger else {
            continue;
        };
        if *trigger == strand.label {
            continue;
        }
        let consumed = consumption_ids(&claimed.semaphores, &decl.name, decl.kind);
        if consumed.is_empty() {
            continue;
        }
        debug!(
            strand_id = %strand.id,
            semaphore = %decl.name,
            from = %strand.label,
            to = %trigger,
            "semaphore trigger fired"
        );
        transition.consumed_semaphores = consumed;
        transition.label = trigger.clone();
        transition.scheduled_at = now;
        transition.retry_count = 0;
        transition.failed_at = None;
        return Some(Executed {
            transition,
            outcome: HopOutcome::Triggered {
                semaphore: decl.name.clone(),
                label: trigger.clone(),
            },
        });
    }
    None
}

fn cancel(
    claimed: &ClaimedStrand,
    prog: &Prog,
    mut transition: Transition,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Executed {
    let Some(label) = prog.cancel_label() else {
        let message = format!("deadline {deadline} passed and prog {} has no cancel label", prog.name());
        let details = json!({"deadline_at": deadline});
        return halt(claimed, transition, PAGE_DEADLINE, &message, details, now);
    };
    debug!(strand_id = %claimed.strand.id, label, "deadline passed; cancelling");
    transition.label = label.to_string();
    transition.deadline_at = None;
    transition.scheduled_at = now;
    transition.retry_count = 0;
    Executed {
        transition,
        outcome: HopOutcome::Cancelled {
            label: label.to_string(),
        },
    }
}

/// Pause the strand and raise a page describing why.
fn halt(
    claimed: &ClaimedStrand,
    mut transition: Transition,
    kind: &'static str,
    message: &str,
    details: Value,
    now: DateTime<Utc>,
) -> Executed {
    let strand = &claimed.strand;
    error!(
        strand_id = %strand.id,
        prog = %strand.prog,
        label = %strand.label,
        kind,
        error = %message,
        "hop failed fatally; paging"
    );
    transition.failed_at = Some(now);
    transition.scheduled_at = paused_until(now);
    transition.page = Some(NewPage::for_strand(strand, kind, message, details));
    Executed {
        transition,
        outcome: HopOutcome::Halted { kind },
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .map(|at| at.min(paused_until(now)))
        .unwrap_or_else(|| paused_until(now))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::{Semaphore, SemaphoreKind};
    use crate::strand::{CHILD_EXIT_KEY, Frame, LeaseClaim};
    use uuid::Uuid;

    fn frame(value: Value) -> Frame {
        value.as_object().cloned().expect("object frame")
    }

    fn claimed(prog: &str, label: &str, data: Value) -> ClaimedStrand {
        let now = Utc::now();
        let strand = NewStrand::new(prog, label, frame(data)).into_strand(now);
        ClaimedStrand {
            strand,
            lease: LeaseClaim::new(Uuid::new_v4(), now, Duration::from_secs(30)),
            semaphores: Vec::new(),
            children: Vec::new(),
        }
    }

    fn runtime(progs: Vec<Prog>) -> Runtime {
        let mut registry = ProgRegistry::new();
        for prog in progs {
            registry.register(prog).expect("register");
        }
        Runtime::new(Arc::new(registry), RetryPolicy::immediate(2))
    }

    async fn run(runtime: &Runtime, claimed: &ClaimedStrand) -> Executed {
        runtime
            .execute(claimed, Utc::now(), &CancellationToken::new())
            .await
            .expect("lease held")
    }

    fn vm_prog() -> Prog {
        Prog::builder("Vm")
            .label("start", |ctx: &mut HopContext| {
                ctx.set("booted", true);
                Ok(Directive::hop("wait"))
            })
            .label("wait", |_: &mut HopContext| Ok(Directive::nap_secs(30)))
            .label("destroy", |_: &mut HopContext| Ok(Directive::exit(json!({"gone": true}))))
            .label("flaky", |_: &mut HopContext| Err(HopError::transient("ssh timeout")))
            .label("broken", |_: &mut HopContext| Err(HopError::fatal("bad image")))
            .label("give_up", |_: &mut HopContext| Ok(Directive::fail("host gone")))
            .label("failed", |_: &mut HopContext| Ok(Directive::fail("again")))
            .label("panics", |_: &mut HopContext| -> Result<Directive, HopError> {
                panic!("boom")
            })
            .label("stray", |_: &mut HopContext| Ok(Directive::hop("nowhere")))
            .trigger("destroy", SemaphoreKind::Flag, "destroy")
            .fail_label("failed")
            .build()
            .expect("prog")
    }

    #[tokio::test]
    async fn hop_keeps_frame_edits() {
        let runtime = runtime(vec![vm_prog()]);
        let claimed = claimed("Vm", "start", json!({"name": "vm-1"}));
        let executed = run(&runtime, &claimed).await;
        assert_eq!(
            executed.outcome,
            HopOutcome::Hopped {
                label: "wait".to_string()
            }
        );
        let top = executed.transition.stack.top().expect("frame");
        assert_eq!(top.get("booted"), Some(&json!(true)));
        assert_eq!(top.get("name"), Some(&json!("vm-1")));
    }

    #[tokio::test]
    async fn pending_trigger_overrides_handler() {
        let runtime = runtime(vec![vm_prog()]);
        let mut claimed = claimed("Vm", "wait", json!({}));
        let now = Utc::now();
        claimed.semaphores = vec![
            Semaphore::new(claimed.strand.id, "destroy", now),
            Semaphore::new(claimed.strand.id, "destroy", now),
        ];
        let executed = run(&runtime, &claimed).await;
        assert_eq!(executed.transition.label, "destroy");
        assert_eq!(executed.transition.consumed_semaphores.len(), 2);
        assert!(matches!(executed.outcome, HopOutcome::Triggered { .. }));
    }

    #[tokio::test]
    async fn transient_failure_retries_until_exhausted() {
        let runtime = runtime(vec![vm_prog()]);
        let mut claimed = claimed("Vm", "flaky", json!({}));
        let executed = run(&runtime, &claimed).await;
        assert_eq!(executed.transition.retry_count, 1);
        assert!(executed.transition.page.is_none());

        claimed.strand.retry_count = 2;
        let executed = run(&runtime, &claimed).await;
        assert_eq!(
            executed.outcome,
            HopOutcome::Halted {
                kind: PAGE_RETRIES_EXHAUSTED
            }
        );
        assert!(executed.transition.failed_at.is_some());
        assert!(executed.transition.page.is_some());
    }

    #[tokio::test]
    async fn fatal_error_and_panic_halt_with_page() {
        let runtime = runtime(vec![vm_prog()]);
        let executed = run(&runtime, &claimed("Vm", "broken", json!({}))).await;
        assert_eq!(executed.outcome, HopOutcome::Halted { kind: PAGE_FATAL });
        let page = executed.transition.page.expect("page");
        assert_eq!(page.details["label"], json!("broken"));

        let executed = run(&runtime, &claimed("Vm", "panics", json!({}))).await;
        assert_eq!(executed.outcome, HopOutcome::Halted { kind: PAGE_PANIC });
        assert!(
            executed
                .transition
                .page
                .expect("page")
                .summary
                .contains("boom")
        );
    }

    #[tokio::test]
    async fn fail_directive_takes_fail_label_without_page() {
        let runtime = runtime(vec![vm_prog()]);
        let executed = run(&runtime, &claimed("Vm", "give_up", json!({}))).await;
        assert_eq!(executed.transition.label, "failed");
        assert!(executed.transition.page.is_none());
        assert_eq!(
            executed.transition.stack.top().and_then(|f| f.get(FAIL_REASON_KEY)),
            Some(&json!("host gone"))
        );

        let executed = run(&runtime, &claimed("Vm", "failed", json!({}))).await;
        assert_eq!(
            executed.outcome,
            HopOutcome::Halted {
                kind: PAGE_CONFIGURATION
            }
        );
    }

    #[tokio::test]
    async fn unknown_labels_are_configuration_errors() {
        let runtime = runtime(vec![vm_prog()]);
        let executed = run(&runtime, &claimed("Vm", "stray", json!({}))).await;
        assert_eq!(
            executed.outcome,
            HopOutcome::Halted {
                kind: PAGE_CONFIGURATION
            }
        );
        assert_eq!(executed.transition.label, "stray");

        let executed = run(&runtime, &claimed("Nope", "start", json!({}))).await;
        assert_eq!(
            executed.outcome,
            HopOutcome::Halted {
                kind: PAGE_CONFIGURATION
            }
        );
    }

    #[tokio::test]
    async fn call_and_return_use_the_frame_stack() {
        let caller = Prog::builder("Lb")
            .label("start", |_: &mut HopContext| {
                Ok(Directive::call("Cert", "issue", Frame::new(), "installed"))
            })
            .label("installed", |ctx: &mut HopContext| {
                let cert = ctx.take_child_exit().unwrap_or(Value::Null);
                Ok(Directive::exit(cert))
            })
            .build()
            .expect("prog");
        let callee = Prog::builder("Cert")
            .label("issue", |_: &mut HopContext| Ok(Directive::ret(json!({"serial": 9}))))
            .build()
            .expect("prog");
        let runtime = runtime(vec![caller, callee]);

        let mut claimed = claimed("Lb", "start", json!({"name": "lb-1"}));
        let executed = run(&runtime, &claimed).await;
        assert_eq!(executed.transition.prog, "Cert");
        assert_eq!(executed.transition.stack.depth(), 2);

        claimed.strand.prog = executed.transition.prog.clone();
        claimed.strand.label = executed.transition.label.clone();
        claimed.strand.stack = executed.transition.stack.clone();
        let executed = run(&runtime, &claimed).await;
        assert_eq!(executed.transition.prog, "Lb");
        assert_eq!(executed.transition.label, "installed");
        let top = executed.transition.stack.top().expect("frame");
        assert_eq!(top.get(CHILD_EXIT_KEY), Some(&json!({"serial": 9})));
        assert_eq!(top.get("name"), Some(&json!("lb-1")));
    }

    #[tokio::test]
    async fn deadline_moves_to_cancel_label() {
        let prog = Prog::builder("Vm")
            .label("wait", |_: &mut HopContext| Ok(Directive::nap_secs(5)))
            .label("cancel", |_: &mut HopContext| Ok(Directive::exit(Value::Null)))
            .cancel_label("cancel")
            .build()
            .expect("prog");
        let runtime = runtime(vec![prog]);
        let mut claimed = claimed("Vm", "wait", json!({}));
        claimed.strand.deadline_at = Some(Utc::now() - ChronoDuration::seconds(1));
        let executed = run(&runtime, &claimed).await;
        assert_eq!(executed.transition.label, "cancel");
        assert!(executed.transition.deadline_at.is_none());
    }

    #[tokio::test]
    async fn lost_lease_discards_the_hop() {
        let prog = Prog::builder("Slow")
            .label_handler("start", SlowHandler)
            .build()
            .expect("prog");
        let runtime = runtime(vec![prog]);
        let token = CancellationToken::new();
        token.cancel();
        let result = runtime
            .execute(&claimed("Slow", "start", json!({})), Utc::now(), &token)
            .await;
        assert!(result.is_none());
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl crate::prog::LabelHandler for SlowHandler {
        async fn run(&self, _ctx: &mut HopContext) -> Result<Directive, HopError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Directive::exit(Value::Null))
        }
    }
}
