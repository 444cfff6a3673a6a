//! The job lifecycle state machine.
//!
//! [`StateMachine::apply`] validates one eventlog entry against the job's
//! current state and, if it is legal, updates the job. The state
//! precondition is checked first, then the entry context is decoded, and
//! only then is the job mutated, so a rejected entry never leaves a job
//! half-updated.

use serde_json::Value;

use crate::{EventEntry, FsmError, Job, JobFlags, JobState};

/// Every event name the state machine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Submit,
    DependencyAdd,
    DependencyRemove,
    SetFlags,
    Memo,
    Depend,
    Priority,
    Urgency,
    Exception,
    Alloc,
    Free,
    Finish,
    Release,
    Clean,
    PrologStart,
    PrologFinish,
    EpilogStart,
    EpilogFinish,
    FluxRestart,
}

impl EventKind {
    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name {
            "submit" => EventKind::Submit,
            "dependency-add" => EventKind::DependencyAdd,
            "dependency-remove" => EventKind::DependencyRemove,
            "set-flags" => EventKind::SetFlags,
            "memo" => EventKind::Memo,
            "depend" => EventKind::Depend,
            "priority" => EventKind::Priority,
            "urgency" => EventKind::Urgency,
            "exception" => EventKind::Exception,
            "alloc" => EventKind::Alloc,
            "free" => EventKind::Free,
            "finish" => EventKind::Finish,
            "release" => EventKind::Release,
            "clean" => EventKind::Clean,
            "prolog-start" => EventKind::PrologStart,
            "prolog-finish" => EventKind::PrologFinish,
            "epilog-start" => EventKind::EpilogStart,
            "epilog-finish" => EventKind::EpilogFinish,
            "flux-restart" => EventKind::FluxRestart,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Submit => "submit",
            EventKind::DependencyAdd => "dependency-add",
            EventKind::DependencyRemove => "dependency-remove",
            EventKind::SetFlags => "set-flags",
            EventKind::Memo => "memo",
            EventKind::Depend => "depend",
            EventKind::Priority => "priority",
            EventKind::Urgency => "urgency",
            EventKind::Exception => "exception",
            EventKind::Alloc => "alloc",
            EventKind::Free => "free",
            EventKind::Finish => "finish",
            EventKind::Release => "release",
            EventKind::Clean => "clean",
            EventKind::PrologStart => "prolog-start",
            EventKind::PrologFinish => "prolog-finish",
            EventKind::EpilogStart => "epilog-start",
            EventKind::EpilogFinish => "epilog-finish",
            EventKind::FluxRestart => "flux-restart",
        }
    }
}

/// State before and after a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Applies eventlog entries to jobs.
pub struct StateMachine;

impl StateMachine {
    /// Apply `entry` to `job`.
    pub fn apply(job: &mut Job, entry: &EventEntry) -> Result<Transition, FsmError> {
        let from = job.state;
        let name = entry.name.as_str();
        let Some(kind) = EventKind::parse(name) else {
            return Err(FsmError::invalid(name, from));
        };

        match kind {
            EventKind::Submit => {
                require(kind, from, from == JobState::New)?;
                let urgency = int_field::<i32>(entry, "urgency")?;
                let userid = int_field::<u32>(entry, "userid")?;
                let flags = int_field::<u32>(entry, "flags")?;
                job.t_submit = entry.timestamp;
                job.urgency = urgency;
                job.userid = userid;
                job.flags = JobFlags(flags);
                job.state = JobState::Depend;
            }
            EventKind::DependencyAdd => {
                require(kind, from, from == JobState::Depend)?;
                let description = str_field(entry, "description")?;
                job.dependencies.add(description);
            }
            EventKind::DependencyRemove => {
                require(kind, from, from == JobState::Depend)?;
                let description = str_field(entry, "description")?;
                if !job.dependencies.is_outstanding(description) {
                    return Err(FsmError::malformed(
                        name,
                        format!("dependency '{}' is not outstanding", description),
                    ));
                }
                job.dependencies.remove(description);
            }
            EventKind::SetFlags => {
                let names = match entry.get("flags") {
                    Some(Value::Array(names)) => names,
                    _ => return Err(FsmError::malformed(name, "missing 'flags' array")),
                };
                let mut flags = JobFlags::default();
                let mut alloc_bypass = false;
                for value in names {
                    match value.as_str() {
                        Some("alloc-bypass") => alloc_bypass = true,
                        Some(flag) => match JobFlags::from_name(flag) {
                            Some(f) => flags.insert(f),
                            None => {
                                return Err(FsmError::malformed(
                                    name,
                                    format!("unknown flag '{}'", flag),
                                ));
                            }
                        },
                        None => return Err(FsmError::malformed(name, "flag is not a string")),
                    }
                }
                job.flags.insert(flags);
                if alloc_bypass {
                    job.alloc_bypass = true;
                }
            }
            EventKind::Memo => {
                let Some(context) = entry.context.as_ref() else {
                    return Err(FsmError::malformed(name, "missing context"));
                };
                for (key, value) in context {
                    if value.is_null() {
                        job.annotations.remove(key);
                    } else {
                        job.annotations.insert(key.clone(), value.clone());
                    }
                }
            }
            EventKind::Depend => {
                require(kind, from, from == JobState::Depend)?;
                job.state = JobState::Priority;
            }
            EventKind::Priority => {
                require(kind, from, matches!(from, JobState::Priority | JobState::Sched))?;
                job.priority = int_field::<i64>(entry, "priority")?;
                job.state = JobState::Sched;
            }
            EventKind::Urgency => {
                job.urgency = int_field::<i32>(entry, "urgency")?;
            }
            EventKind::Exception => {
                require(kind, from, !matches!(from, JobState::New | JobState::Inactive))?;
                let severity = int_field::<i64>(entry, "severity")?;
                if severity == 0 {
                    capture_end_event(job, entry);
                    job.state = JobState::Cleanup;
                }
            }
            EventKind::Alloc => {
                require(kind, from, matches!(from, JobState::Sched | JobState::Cleanup))?;
                job.has_resources = true;
                if from == JobState::Sched {
                    job.state = JobState::Run;
                }
            }
            EventKind::Free => {
                require(kind, from, from == JobState::Cleanup && job.has_resources)?;
                job.has_resources = false;
            }
            EventKind::Finish => {
                require(kind, from, matches!(from, JobState::Run | JobState::Cleanup))?;
                if from == JobState::Run {
                    capture_end_event(job, entry);
                    job.state = JobState::Cleanup;
                }
            }
            EventKind::Release => {
                require(kind, from, matches!(from, JobState::Run | JobState::Cleanup))?;
                let is_final = match entry.get("final") {
                    Some(Value::Bool(b)) => *b,
                    _ => return Err(FsmError::malformed(name, "missing boolean 'final'")),
                };
                require(kind, from, !(is_final && from == JobState::Run))?;
            }
            EventKind::Clean => {
                require(kind, from, from == JobState::Cleanup)?;
                job.state = JobState::Inactive;
            }
            EventKind::PrologStart => {
                require(kind, from, !job.start_pending)?;
                perilog_start(job, name)?;
            }
            EventKind::PrologFinish => {
                require(kind, from, !job.start_pending)?;
                job.perilog_active = job.perilog_active.saturating_sub(1);
            }
            EventKind::EpilogStart => {
                require(kind, from, from == JobState::Cleanup)?;
                perilog_start(job, name)?;
            }
            EventKind::EpilogFinish => {
                require(kind, from, from == JobState::Cleanup)?;
                job.perilog_active = job.perilog_active.saturating_sub(1);
            }
            EventKind::FluxRestart => {
                require(kind, from, from == JobState::Sched)?;
                job.state = JobState::Priority;
            }
        }

        Ok(Transition {
            from,
            to: job.state,
        })
    }
}

fn require(kind: EventKind, state: JobState, ok: bool) -> Result<(), FsmError> {
    if ok {
        Ok(())
    } else {
        Err(FsmError::invalid(kind.as_str(), state))
    }
}

fn capture_end_event(job: &mut Job, entry: &EventEntry) {
    if job.end_event.is_none() {
        job.end_event = Some(entry.clone());
    }
}

fn perilog_start(job: &mut Job, name: &str) -> Result<(), FsmError> {
    job.perilog_active = job
        .perilog_active
        .checked_add(1)
        .ok_or_else(|| FsmError::ResourceExhausted {
            event: name.to_string(),
            what: "perilog counter",
        })?;
    Ok(())
}

fn int_field<T: TryFrom<i64>>(entry: &EventEntry, key: &str) -> Result<T, FsmError> {
    entry
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| FsmError::malformed(&entry.name, format!("missing or invalid '{}'", key)))
}

fn str_field<'a>(entry: &'a EventEntry, key: &str) -> Result<&'a str, FsmError> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FsmError::malformed(&entry.name, format!("missing string '{}'", key)))
}
