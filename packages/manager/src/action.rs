//! Action dispatch.
//!
//! After every applied event the engine runs [`Engine::act`] for the job,
//! which issues whatever side effects the job's current state calls for.
//! Every action is guarded by a job flag, so dispatching twice in the same
//! state sends nothing new.

use job_core::{EventEntry, JobFlags, JobId, JobState};

use crate::engine::{Engine, PostFlags, QueuedPost};
use crate::error::ManagerResult;
use crate::jobtap::PRIORITY_MIN;
use crate::links::{SchedulerRequest, StartRequest};

impl Engine {
    pub(crate) fn act(&mut self, job_id: JobId) -> ManagerResult<()> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Ok(());
        };

        match job.state {
            JobState::New => {}

            JobState::Depend => {
                if job.dependencies.count() == 0 && !job.depend_posted {
                    job.depend_posted = true;
                    self.post_followup(job_id, "depend");
                }
            }

            JobState::Priority => {
                // Re-entry from SCHED: withdraw the request.
                if job.alloc_queued {
                    self.alloc.dequeue(job_id);
                    job.alloc_queued = false;
                }
                if job.alloc_pending && !job.alloc_cancel_sent {
                    self.links
                        .scheduler
                        .send(SchedulerRequest::Cancel { job_id })?;
                    job.alloc_cancel_sent = true;
                    self.alloc.cancel_sent(job_id);
                }
            }

            JobState::Sched => {
                if job.priority == PRIORITY_MIN {
                    // Held: no request until the priority rises again.
                    if job.alloc_queued {
                        self.alloc.dequeue(job_id);
                        job.alloc_queued = false;
                    }
                    if job.alloc_pending && !job.alloc_cancel_sent {
                        self.links
                            .scheduler
                            .send(SchedulerRequest::Cancel { job_id })?;
                        job.alloc_cancel_sent = true;
                        self.alloc.cancel_sent(job_id);
                    }
                } else if job.alloc_queued || job.alloc_pending {
                    self.alloc.reorder(job);
                } else if !job.alloc_bypass {
                    self.alloc.enqueue(job);
                    job.alloc_queued = true;
                }
                self.recalc_pending()?;
            }

            JobState::Run => {
                if job.perilog_active == 0 && !job.start_pending {
                    self.links.exec.start(StartRequest {
                        job_id,
                        userid: job.userid,
                    })?;
                    job.start_pending = true;
                }
            }

            JobState::Cleanup => {
                if job.alloc_pending && !job.alloc_cancel_sent {
                    self.links
                        .scheduler
                        .send(SchedulerRequest::Cancel { job_id })?;
                    job.alloc_cancel_sent = true;
                    self.alloc.cancel_sent(job_id);
                }
                if job.alloc_queued {
                    self.alloc.dequeue(job_id);
                    job.alloc_queued = false;
                }

                // start_pending stays set until the final release, after
                // which resources may go back to the scheduler.
                if job.has_resources
                    && job.perilog_active == 0
                    && !job.alloc_bypass
                    && !job.start_pending
                    && !job.free_pending
                {
                    self.links
                        .scheduler
                        .send(SchedulerRequest::Free { job_id })?;
                    job.free_pending = true;
                }

                if !job.alloc_queued
                    && !job.alloc_pending
                    && !job.free_pending
                    && !job.start_pending
                    && !job.has_resources
                    && !job.clean_posted
                {
                    job.clean_posted = true;
                    self.post_followup(job_id, "clean");
                }
            }

            JobState::Inactive => {
                if job.active {
                    job.active = false;
                    if job.flags.contains(JobFlags::WAITABLE) {
                        self.links.wait.notify_inactive(job);
                    }
                    self.active = self.active.saturating_sub(1);
                }
                self.check_drain();
            }
        }

        self.pump_alloc_queue()
    }

    /// Send queued alloc requests while the outstanding limit allows.
    pub(crate) fn pump_alloc_queue(&mut self) -> ManagerResult<()> {
        while let Some(job_id) = self.alloc.send_next(self.config.alloc_limit) {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                self.alloc.alloc_finished(job_id);
                continue;
            };
            job.alloc_queued = false;
            let request = SchedulerRequest::Alloc {
                job_id,
                priority: job.priority,
                userid: job.userid,
                t_submit: job.t_submit,
            };
            if let Err(e) = self.links.scheduler.send(request) {
                self.alloc.alloc_finished(job_id);
                return Err(e.into());
            }
            job.alloc_pending = true;
            self.alloc.mark_pending(job);
        }
        Ok(())
    }

    /// Cancel an outstanding request that a queued job outranks.
    fn recalc_pending(&mut self) -> ManagerResult<()> {
        let Some(victim) = self.alloc.recalc_pending(self.config.alloc_limit) else {
            return Ok(());
        };
        tracing::debug!("Canceling alloc request of job {} for a better job", victim);
        self.links
            .scheduler
            .send(SchedulerRequest::Cancel { job_id: victim })?;
        self.alloc.cancel_sent(victim);
        if let Some(job) = self.jobs.get_mut(&victim) {
            job.alloc_cancel_sent = true;
        }
        Ok(())
    }

    /// Clear the guard of a follow-up that was not applied, so the next
    /// dispatch for the job posts it again.
    pub(crate) fn followup_failed(&mut self, job_id: JobId, name: &str) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        match name {
            "depend" => job.depend_posted = false,
            "clean" => job.clean_posted = false,
            _ => {}
        }
    }

    fn post_followup(&mut self, job_id: JobId, name: &str) {
        self.queue_post(QueuedPost {
            job_id,
            entry: EventEntry::now(name, None),
            flags: PostFlags::empty(),
        });
    }
}
