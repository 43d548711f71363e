// Workflow Executor - Advances one enrollment at a time through its step graph

use cadence_shared::{EnrollmentStatus, ExitReason, StepOutcome};
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::conditions::evaluate_groups;
use super::enrollment::{EnrollMode, EnrollResult, EnrollmentManager};
use super::error::{EngineError, EngineResult};
use super::models::{AutomationVersion, Enrollment, StepExecutionLog, WaitState};
use super::steps::{add_saturating, AdvisorStrategy, RetryPolicy, SplitBranch, Step, StepId, StepKind, WaitSpec};
use super::store::EngineStore;
use super::templates::{render, render_map, render_value};
use super::wait::{evaluate_wait, WaitDefaults, WaitOutcome};
use crate::services::{
    Collaborators, HttpRequest, Lead, LeadUpdate, NewCalendarEvent, NewTask, OutboundMessage, TaskKind,
};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// Claims older than this may be taken over by another worker
    pub claim_ttl: Duration,
    /// Steps one advance may run without suspending before the run is failed
    pub max_steps_per_advance: usize,
    pub wait_defaults: WaitDefaults,
    /// Used by webhook steps that carry no retry policy of their own
    pub webhook_retry: RetryPolicy,
    /// How long a run of a paused automation sleeps before checking again
    pub paused_recheck: Duration,
}

/// What one call to [`StepExecutor::advance`] did
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Not runnable, or owned by another worker
    NotClaimed,
    Suspended { resumes_at: DateTime<Utc> },
    Finished { status: EnrollmentStatus },
    /// Ownership was lost mid-advance (cascade exit or stale-claim takeover)
    Conflict,
}

enum StepFlow {
    Next(StepId),
    Suspend { resumes_at: DateTime<Utc>, state: WaitState },
    Finished { transfer_to: Option<Uuid> },
}

pub struct StepExecutor {
    store: Arc<dyn EngineStore>,
    collaborators: Collaborators,
    enrollments: Arc<EnrollmentManager>,
    settings: ExecutorSettings,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn EngineStore>,
        collaborators: Collaborators,
        enrollments: Arc<EnrollmentManager>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            collaborators,
            enrollments,
            settings,
        }
    }

    /// Claim the enrollment and run it until it suspends or terminates
    pub async fn advance(&self, enrollment_id: Uuid) -> EngineResult<AdvanceOutcome> {
        let token = Uuid::new_v4();
        let now = Utc::now();
        let stale_before = now - self.settings.claim_ttl;

        let Some(mut run) = self.store.claim(enrollment_id, token, now, stale_before).await? else {
            debug!(enrollment_id = %enrollment_id, "Enrollment not claimable, skipping");
            return Ok(AdvanceOutcome::NotClaimed);
        };

        let started = Instant::now();
        let caught = AssertUnwindSafe(self.drive(&mut run, token)).catch_unwind().await;
        let result = match caught {
            Ok(result) => result,
            Err(payload) => self.fail_panicked(&mut run, token, panic_message(payload.as_ref())).await,
        };

        match &result {
            Ok(outcome) => debug!(
                enrollment_id = %enrollment_id,
                duration_ms = started.elapsed().as_millis() as u64,
                "Advance finished: {:?}",
                outcome
            ),
            Err(e) => {
                // Leave the run where it was; the claim goes stale and the sweep retries it.
                error!(enrollment_id = %enrollment_id, "Advance aborted: {}", e);
                run.last_error = Some(e.to_string());
                if let Err(release_err) = self.store.update_claimed(&run, token, true).await {
                    warn!(enrollment_id = %enrollment_id, "Failed to release claim: {}", release_err);
                }
            }
        }
        result
    }

    /// A panic while advancing fails that run alone
    async fn fail_panicked(&self, run: &mut Enrollment, token: Uuid, message: String) -> EngineResult<AdvanceOutcome> {
        error!(enrollment_id = %run.id, "Advance panicked: {}", message);
        let step_id = run.current_step_id.clone().unwrap_or_else(|| "-".to_string());
        let message = format!("advance panicked: {}", message);
        run.fail(message.clone(), Utc::now());
        self.log(run, &step_id, "advance", StepOutcome::Failed, Value::Null, Some(message)).await?;
        self.release(run, token, None).await
    }

    async fn drive(&self, run: &mut Enrollment, token: Uuid) -> EngineResult<AdvanceOutcome> {
        let now = Utc::now();
        let automation = self
            .store
            .get_automation(run.automation_id)
            .await?
            .filter(|a| a.deleted_at.is_none());

        let Some(automation) = automation else {
            run.terminate(ExitReason::AutomationDeleted, now);
            let step_id = run.current_step_id.clone().unwrap_or_else(|| "-".to_string());
            let detail = json!({ "event": "exited", "reason": ExitReason::AutomationDeleted.as_str() });
            self.log(run, &step_id, "exit", StepOutcome::Skipped, detail, None).await?;
            return self.release(run, token, None).await;
        };

        if automation.is_paused() {
            let resumes_at = add_saturating(now, self.settings.paused_recheck);
            debug!(enrollment_id = %run.id, automation_id = %automation.id, "Automation paused, parking run");
            let wait_state = run.wait_state.clone();
            run.suspend_until(resumes_at, wait_state);
            return self.release(run, token, None).await;
        }

        let Some(version) = self.store.get_version(run.automation_id, run.automation_version).await? else {
            let message = format!("pinned version {} is missing", run.automation_version);
            run.fail(message.clone(), now);
            self.log(run, "-", "advance", StepOutcome::Failed, Value::Null, Some(message)).await?;
            return self.release(run, token, None).await;
        };

        if run.status == EnrollmentStatus::Waiting {
            run.status = EnrollmentStatus::Active;
            run.resumes_at = None;
        }

        let mut executed = 0usize;
        loop {
            let Some(step) = run.current_step_id.as_deref().and_then(|id| version.steps.get(id)) else {
                let message = format!("step '{}' not found", run.current_step_id.as_deref().unwrap_or("-"));
                run.fail(message.clone(), Utc::now());
                self.log(run, "-", "advance", StepOutcome::Failed, Value::Null, Some(message)).await?;
                return self.release(run, token, None).await;
            };

            executed += 1;
            if executed > self.settings.max_steps_per_advance {
                let message = format!(
                    "exceeded {} steps without suspending",
                    self.settings.max_steps_per_advance
                );
                warn!(enrollment_id = %run.id, "{}", message);
                run.fail(message.clone(), Utc::now());
                self.log(run, &step.id, step.kind.name(), StepOutcome::Failed, Value::Null, Some(message))
                    .await?;
                return self.release(run, token, None).await;
            }

            let now = Utc::now();
            let flow = match self.execute_step(run, token, step, &version, now).await {
                Ok(flow) => flow,
                Err(e @ EngineError::Store(_)) => return Err(e),
                Err(EngineError::ConcurrencyConflict(_)) => return Ok(self.conflict(run)),
                Err(e) => {
                    error!(enrollment_id = %run.id, step_id = %step.id, "Step failed: {}", e);
                    self.log(run, &step.id, step.kind.name(), StepOutcome::Failed, Value::Null, Some(e.to_string()))
                        .await?;
                    run.fail(e.to_string(), now);
                    return self.release(run, token, None).await;
                }
            };

            run.last_advanced_at = Some(now);
            match flow {
                StepFlow::Next(next) => {
                    run.current_step_id = Some(next);
                    run.claimed_at = Some(now);
                    if !self.store.update_claimed(run, token, false).await? {
                        return Ok(self.conflict(run));
                    }
                }
                StepFlow::Suspend { resumes_at, state } => {
                    run.suspend_until(resumes_at, Some(state));
                    return self.release(run, token, None).await;
                }
                StepFlow::Finished { transfer_to } => {
                    return self.release(run, token, transfer_to).await;
                }
            }
        }
    }

    /// Persist and drop ownership; a transfer enrolls the lead elsewhere afterwards.
    async fn release(&self, run: &mut Enrollment, token: Uuid, transfer_to: Option<Uuid>) -> EngineResult<AdvanceOutcome> {
        if !self.store.update_claimed(run, token, true).await? {
            return Ok(self.conflict(run));
        }

        if let Some(target) = transfer_to {
            self.transfer(run, target).await;
        }

        Ok(match run.status {
            EnrollmentStatus::Waiting => AdvanceOutcome::Suspended {
                resumes_at: run.resumes_at.unwrap_or_else(Utc::now),
            },
            status => AdvanceOutcome::Finished { status },
        })
    }

    /// Enroll the lead in `target` and record how that went on the source run
    async fn transfer(&self, run: &Enrollment, target: Uuid) {
        let (outcome, detail, error) = match self.enrollments.enroll(target, run.lead_id, EnrollMode::Policy).await {
            Ok(EnrollResult::Enrolled(next)) => {
                info!(lead_id = %run.lead_id, from = %run.automation_id, to = %target, enrollment_id = %next.id, "Lead transferred");
                (
                    StepOutcome::Completed,
                    json!({ "event": "transfer_enrolled", "target": target, "enrollment_id": next.id }),
                    None,
                )
            }
            Ok(EnrollResult::Skipped(decision)) => {
                info!(lead_id = %run.lead_id, to = %target, "Transfer enrollment skipped: {}", decision.describe());
                (
                    StepOutcome::Skipped,
                    json!({ "event": "transfer_skipped", "target": target, "reason": decision.describe() }),
                    None,
                )
            }
            Err(e) => {
                warn!(lead_id = %run.lead_id, to = %target, "Transfer enrollment failed: {}", e);
                (
                    StepOutcome::Failed,
                    json!({ "event": "transfer_failed", "target": target }),
                    Some(e.to_string()),
                )
            }
        };

        let step_id = run.current_step_id.clone().unwrap_or_else(|| "-".to_string());
        if let Err(e) = self.log(run, &step_id, "go_to_workflow", outcome, detail, error).await {
            warn!(enrollment_id = %run.id, "Failed to log transfer outcome: {}", e);
        }
    }

    /// Push the claim forward during a long step. Losing it aborts the step.
    async fn renew_claim(&self, run: &mut Enrollment, token: Uuid) -> EngineResult<()> {
        run.claimed_at = Some(Utc::now());
        if self.store.update_claimed(run, token, false).await? {
            Ok(())
        } else {
            Err(EngineError::ConcurrencyConflict(format!("enrollment {} changed owner", run.id)))
        }
    }

    fn conflict(&self, run: &Enrollment) -> AdvanceOutcome {
        let err = EngineError::ConcurrencyConflict(format!("enrollment {} changed owner", run.id));
        warn!(enrollment_id = %run.id, "{}; discarding this advance", err);
        AdvanceOutcome::Conflict
    }

    async fn execute_step(
        &self,
        run: &mut Enrollment,
        token: Uuid,
        step: &Step,
        version: &AutomationVersion,
        now: DateTime<Utc>,
    ) -> EngineResult<StepFlow> {
        match &step.kind {
            StepKind::Trigger => {
                self.log(run, &step.id, "trigger", StepOutcome::Skipped, json!({ "event": "trigger_reentered" }), None)
                    .await?;
                Ok(StepFlow::Next(successor(step)?))
            }

            StepKind::Condition(config) => {
                let lead = self.fresh_lead(run, step).await?;
                let matched = evaluate_groups(&config.groups, config.mode, &lead.snapshot(), now);
                let next = if matched { &config.true_next } else { &config.false_next };
                self.log(run, &step.id, "condition", StepOutcome::Completed, json!({ "result": matched, "next": next }), None)
                    .await?;
                Ok(StepFlow::Next(next.clone()))
            }

            StepKind::Split(config) => {
                let branch = match run
                    .variant_assignments
                    .get(&step.id)
                    .and_then(|label| config.branches.iter().find(|b| &b.label == label))
                {
                    Some(existing) => existing,
                    None => {
                        let bucket = split_bucket(run.lead_id, run.automation_id, &step.id);
                        pick_branch(&config.branches, bucket)
                            .ok_or_else(|| EngineError::step(&step.id, "split has no branches"))?
                    }
                };
                run.variant_assignments.insert(step.id.clone(), branch.label.clone());
                self.log(run, &step.id, "split", StepOutcome::Completed, json!({ "variant": branch.label }), None)
                    .await?;
                Ok(StepFlow::Next(branch.next.clone()))
            }

            StepKind::Wait(spec) => self.execute_wait(run, step, spec, now).await,

            StepKind::GoToWorkflow(config) => {
                run.terminate(ExitReason::Transferred, now);
                if !config.preserve_history {
                    self.store.delete_logs_for_enrollment(run.id).await?;
                }
                self.log(
                    run,
                    &step.id,
                    "go_to_workflow",
                    StepOutcome::Completed,
                    json!({ "event": "exited", "reason": ExitReason::Transferred.as_str(), "target": config.automation_id }),
                    None,
                )
                .await?;
                Ok(StepFlow::Finished { transfer_to: Some(config.automation_id) })
            }

            StepKind::EndWorkflow(config) => {
                if let Some(status) = &config.lead_status {
                    self.collaborators
                        .leads
                        .update_lead(run.lead_id, &LeadUpdate::status(status))
                        .await
                        .map_err(|e| EngineError::step(&step.id, e.to_string()))?;
                }
                run.terminate(config.reason, now);
                run.current_step_id = Some(step.id.clone());
                self.log(
                    run,
                    &step.id,
                    "end_workflow",
                    StepOutcome::Completed,
                    json!({ "event": "ended", "reason": config.reason.as_str(), "lead_status": config.lead_status }),
                    None,
                )
                .await?;
                info!(enrollment_id = %run.id, reason = config.reason.as_str(), version = version.version, "Run ended");
                Ok(StepFlow::Finished { transfer_to: None })
            }

            _ => {
                let lead = self.fresh_lead(run, step).await?;
                let detail = self.execute_action(run, token, step, &lead, now).await?;
                self.log(run, &step.id, step.kind.name(), StepOutcome::Completed, detail, None).await?;
                Ok(StepFlow::Next(successor(step)?))
            }
        }
    }

    async fn execute_wait(&self, run: &mut Enrollment, step: &Step, spec: &WaitSpec, now: DateTime<Utc>) -> EngineResult<StepFlow> {
        let snapshot = match spec {
            WaitSpec::UntilCondition { .. } => self.fresh_lead(run, step).await?.snapshot(),
            _ => Value::Null,
        };
        let first_entry = run.wait_state.as_ref().is_none_or(|s| s.step_id != step.id);

        match evaluate_wait(step, spec, run.wait_state.as_ref(), &snapshot, now, self.settings.wait_defaults)? {
            WaitOutcome::Continue { next, timed_out } => {
                run.wait_state = None;
                let next = next.ok_or_else(|| EngineError::step(&step.id, "wait has no successor"))?;
                self.log(
                    run,
                    &step.id,
                    "wait",
                    StepOutcome::Completed,
                    json!({ "event": "resumed", "timed_out": timed_out, "next": next }),
                    None,
                )
                .await?;
                Ok(StepFlow::Next(next))
            }
            WaitOutcome::Suspend { resumes_at, state } => {
                if first_entry {
                    self.log(
                        run,
                        &step.id,
                        "wait",
                        StepOutcome::Completed,
                        json!({ "event": "waiting", "resumes_at": resumes_at, "deadline": state.deadline }),
                        None,
                    )
                    .await?;
                }
                debug!(enrollment_id = %run.id, step_id = %step.id, %resumes_at, "Run suspended");
                Ok(StepFlow::Suspend { resumes_at, state })
            }
        }
    }

    /// Dispatch an action step to its collaborator. Returns the log detail.
    async fn execute_action(
        &self,
        run: &mut Enrollment,
        token: Uuid,
        step: &Step,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> EngineResult<Value> {
        let snapshot = lead.snapshot();
        let step_err = |e: crate::services::CollaboratorError| EngineError::step(&step.id, e.to_string());
        let c = &self.collaborators;

        match &step.kind {
            StepKind::SendMessage(config) => {
                let to = match &config.to {
                    Some(to) => render(to, &snapshot),
                    None => lead.address_for(config.channel).unwrap_or_default(),
                };
                if to.trim().is_empty() {
                    return Err(EngineError::step(
                        &step.id,
                        format!("lead has no {} address", config.channel.as_str()),
                    ));
                }

                let message = OutboundMessage {
                    lead_id: lead.id,
                    channel: config.channel,
                    to: to.clone(),
                    subject: config.subject.as_deref().map(|s| render(s, &snapshot)),
                    body: config.body.as_deref().map(|b| render(b, &snapshot)),
                    template_id: config.template_id.clone(),
                    variables: render_map(&config.variables, &snapshot),
                };
                let receipt = c.messages.send(&message).await.map_err(step_err)?;
                Ok(json!({
                    "channel": config.channel.as_str(),
                    "to": to,
                    "provider_message_id": receipt.provider_message_id,
                }))
            }

            StepKind::UpdateLead(config) => {
                let update = LeadUpdate {
                    fields: config
                        .fields
                        .iter()
                        .map(|(k, v)| (k.clone(), render_value(v, &snapshot)))
                        .collect(),
                    add_tags: config.add_tags.clone(),
                    remove_tags: config.remove_tags.clone(),
                    score_delta: config.score_delta,
                    status: config.status.clone(),
                    ..Default::default()
                };
                c.leads.update_lead(lead.id, &update).await.map_err(step_err)?;
                Ok(json!({
                    "fields": update.fields.keys().collect::<Vec<_>>(),
                    "add_tags": update.add_tags,
                    "remove_tags": update.remove_tags,
                    "score_delta": update.score_delta,
                }))
            }

            StepKind::AssignAdvisor(config) => {
                let index = match config.strategy {
                    AdvisorStrategy::Fixed => 0,
                    AdvisorStrategy::Distributed => {
                        split_bucket(run.lead_id, run.automation_id, &step.id) as usize % config.advisor_ids.len().max(1)
                    }
                };
                let advisor = config
                    .advisor_ids
                    .get(index)
                    .ok_or_else(|| EngineError::step(&step.id, "no advisors configured"))?;
                c.leads.update_lead(lead.id, &LeadUpdate::advisor(advisor)).await.map_err(step_err)?;
                Ok(json!({ "advisor": advisor }))
            }

            StepKind::ChangeStage(config) => {
                let stage = render(&config.stage, &snapshot);
                c.leads.update_lead(lead.id, &LeadUpdate::stage(&stage)).await.map_err(step_err)?;
                Ok(json!({ "stage": stage }))
            }

            StepKind::CreateTask(config) => {
                let task = NewTask {
                    lead_id: lead.id,
                    automation_id: Some(run.automation_id),
                    kind: TaskKind::Task,
                    title: render(&config.title, &snapshot),
                    description: config.description.as_deref().map(|d| render(d, &snapshot)),
                    due_at: config.due_in.map(|d| add_saturating(now, d.to_duration())),
                    assignee: config.assignee.clone().or_else(|| lead.str_field("advisor").map(str::to_string)),
                    priority: config.priority.clone(),
                    channel: None,
                };
                let task_id = c.tasks.create_task(&task).await.map_err(step_err)?;
                Ok(json!({ "task_id": task_id, "due_at": task.due_at }))
            }

            StepKind::CreateCalendarEvent(config) => {
                let starts_at = add_saturating(now, config.starts_in.to_duration());
                let event = NewCalendarEvent {
                    lead_id: lead.id,
                    title: render(&config.title, &snapshot),
                    description: config.description.as_deref().map(|d| render(d, &snapshot)),
                    starts_at,
                    ends_at: add_saturating(starts_at, Duration::minutes(i64::from(config.duration_minutes))),
                    location: config.location.clone(),
                    attendees: config.attendees.iter().map(|a| render(a, &snapshot)).collect(),
                };
                let event_id = c.tasks.create_calendar_event(&event).await.map_err(step_err)?;
                Ok(json!({ "event_id": event_id, "starts_at": starts_at }))
            }

            StepKind::Webhook(config) => {
                let request = HttpRequest {
                    method: config.method,
                    url: render(&config.url, &snapshot),
                    headers: render_map(&config.headers, &snapshot),
                    body: config.body.as_ref().map(|b| render_value(b, &snapshot)),
                };
                let policy = config.retry.unwrap_or(self.settings.webhook_retry);
                let mut retries = 0u32;

                loop {
                    match c.http.call(&request).await {
                        Ok(response) => {
                            return Ok(json!({
                                "url": request.url,
                                "status_code": response.status,
                                "retries": retries,
                            }));
                        }
                        Err(e) if e.is_transient() && retries < policy.max_retries => {
                            retries += 1;
                            let delay = policy.delay_for(retries);
                            warn!(
                                enrollment_id = %run.id,
                                step_id = %step.id,
                                "Webhook failed, retrying ({}/{}) in {:?}: {}",
                                retries,
                                policy.max_retries,
                                delay,
                                e
                            );
                            self.renew_claim(run, token).await?;
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) => {
                            return Err(EngineError::step(
                                &step.id,
                                format!("webhook failed after {} retries: {}", retries, e),
                            ));
                        }
                    }
                }
            }

            StepKind::ListAdd(config) => {
                let added = c.lists.add(&config.list_id, lead.id).await.map_err(step_err)?;
                Ok(json!({ "list_id": config.list_id, "changed": added }))
            }

            StepKind::ListRemove(config) => {
                let removed = c.lists.remove(&config.list_id, lead.id).await.map_err(step_err)?;
                Ok(json!({ "list_id": config.list_id, "changed": removed }))
            }

            StepKind::ScheduleFollowup(config) => {
                let task = NewTask {
                    lead_id: lead.id,
                    automation_id: Some(run.automation_id),
                    kind: TaskKind::Followup,
                    title: render(&config.note, &snapshot),
                    description: None,
                    due_at: Some(add_saturating(now, config.after.to_duration())),
                    assignee: config.assignee.clone().or_else(|| lead.str_field("advisor").map(str::to_string)),
                    priority: None,
                    channel: config.channel,
                };
                let task_id = c.tasks.create_task(&task).await.map_err(step_err)?;
                Ok(json!({ "task_id": task_id, "due_at": task.due_at }))
            }

            StepKind::Trigger
            | StepKind::Condition(_)
            | StepKind::Split(_)
            | StepKind::Wait(_)
            | StepKind::GoToWorkflow(_)
            | StepKind::EndWorkflow(_) => Err(EngineError::step(&step.id, "not an action step")),
        }
    }

    /// Current lead attributes; placeholders never read a cached snapshot.
    async fn fresh_lead(&self, run: &Enrollment, step: &Step) -> EngineResult<Lead> {
        self.collaborators
            .leads
            .get_lead(run.lead_id)
            .await
            .map_err(|e| EngineError::step(&step.id, e.to_string()))?
            .ok_or_else(|| EngineError::step(&step.id, format!("lead {} not found", run.lead_id)))
    }

    async fn log(
        &self,
        run: &Enrollment,
        step_id: &str,
        step_kind: &str,
        outcome: StepOutcome,
        detail: Value,
        error: Option<String>,
    ) -> EngineResult<()> {
        let mut entry = StepExecutionLog::new(run, step_id, step_kind, outcome, Utc::now()).with_detail(detail);
        entry.error = error;
        self.store.append_log(&entry).await?;
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn successor(step: &Step) -> EngineResult<StepId> {
    step.next
        .clone()
        .ok_or_else(|| EngineError::step(&step.id, "step has no successor"))
}

/// Stable bucket in 0..100 for a (lead, automation, step) triple
pub fn split_bucket(lead_id: Uuid, automation_id: Uuid, step_id: &str) -> u8 {
    let mut hasher = Sha1::new();
    hasher.update(lead_id.as_bytes());
    hasher.update(automation_id.as_bytes());
    hasher.update(step_id.as_bytes());
    let digest = hasher.finalize();
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (value % 100) as u8
}

/// Walk cumulative percentages; the last branch absorbs any rounding gap.
pub fn pick_branch(branches: &[SplitBranch], bucket: u8) -> Option<&SplitBranch> {
    let mut upper = 0u32;
    for branch in branches {
        upper += u32::from(branch.percentage);
        if u32::from(bucket) < upper {
            return Some(branch);
        }
    }
    branches.last()
}
