use chrono::Utc;
use tracing::{info, instrument};

use crate::{
    error::Result,
    schedule::validate_interval,
    store::Store,
    types::{Instance, InstanceStatus, Job, JobPath, Registration, Schedule},
};

/// Job management used by the HTTP adapter: register, unregister, inspect.
///
/// Holds no state besides the store handle; everything it knows is read from
/// committed rows, so any number of registries and engines can share a store.
#[derive(Clone)]
pub struct JobRegistry {
    store: Store,
}

impl JobRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persist a job and its first instance.
    ///
    /// Fails with `Conflict` when the path is taken, unless `reg.replace` is set.
    #[instrument(skip(self, reg), fields(job_path = %reg.path, one_off = reg.schedule.is_one_off()))]
    pub fn register(&self, reg: Registration) -> Result<(Job, Instance)> {
        if let Schedule::Recurring { interval, .. } = &reg.schedule {
            validate_interval(*interval)?;
        }
        let (job, first) = self.store.insert_job(&reg, Utc::now())?;
        info!(job_id = %job.id, run_at = %first.run_at, "job registered");
        Ok((job, first))
    }

    /// Remove a job and its pending instances. In-flight dispatches finish.
    #[instrument(skip(self), fields(job_path = %path))]
    pub fn unregister(&self, path: &JobPath) -> Result<()> {
        let dropped = self.store.delete_job(path)?;
        info!(dropped, "job unregistered");
        Ok(())
    }

    /// The live job at `path` and every instance of its current generation.
    pub fn get(&self, path: &JobPath) -> Result<Option<(Job, Vec<Instance>)>> {
        let Some(job) = self.store.get_job(path)? else {
            return Ok(None);
        };
        let instances = self.store.instances_for_job(&job.id)?;
        Ok(Some((job, instances)))
    }

    /// Instances that exhausted their retries, most recent first.
    pub fn failed_instances(&self, limit: usize) -> Result<Vec<Instance>> {
        self.store.instances_with_status(InstanceStatus::Failed, limit)
    }

    /// Put a failed instance back in the queue with a fresh attempt budget.
    #[instrument(skip(self))]
    pub fn reset_instance(&self, id: &str) -> Result<Instance> {
        let instance = self.store.reset_instance(id, Utc::now())?;
        info!(job_path = %instance.job_path, "failed instance reset");
        Ok(instance)
    }

    pub fn status_counts(&self) -> Result<Vec<(InstanceStatus, u64)>> {
        self.store.status_counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use chrono::TimeDelta;
    use rusqlite::Connection;

    fn registry() -> JobRegistry {
        JobRegistry::new(Store::from_connection(Connection::open_in_memory().unwrap()).unwrap())
    }

    fn reg(path: &str, schedule: Schedule) -> Registration {
        Registration {
            path: JobPath::parse(path).unwrap(),
            body: b"testBody".to_vec(),
            schedule,
            replace: false,
        }
    }

    #[test]
    fn register_then_get() {
        let r = registry();
        let (job, first) = r
            .register(reg("testPath", Schedule::OneOff { first_run: None }))
            .unwrap();
        assert!(job.one_off);
        assert_eq!(first.status, InstanceStatus::Pending);

        let (stored, instances) = r.get(&job.path).unwrap().unwrap();
        assert_eq!(stored.body, b"testBody");
        assert_eq!(instances.len(), 1);
    }

    #[test]
    fn recurring_requires_positive_interval() {
        let r = registry();
        let err = r
            .register(reg(
                "zero",
                Schedule::Recurring {
                    interval: TimeDelta::zero(),
                    first_run: None,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(r.get(&JobPath::parse("zero").unwrap()).unwrap().is_none());
    }

    #[test]
    fn recurring_first_run_override() {
        let r = registry();
        let at = Utc::now() - TimeDelta::hours(1);
        let (job, first) = r
            .register(reg(
                "rec",
                Schedule::Recurring {
                    interval: TimeDelta::seconds(5),
                    first_run: Some(at),
                },
            ))
            .unwrap();
        assert_eq!(job.interval(), Some(TimeDelta::seconds(5)));
        assert!(!job.one_off);
        assert_eq!(first.run_at.timestamp_micros(), at.timestamp_micros());
    }

    #[test]
    fn unregister_twice_is_not_found() {
        let r = registry();
        let path = JobPath::parse("bye").unwrap();
        r.register(reg("bye", Schedule::OneOff { first_run: None }))
            .unwrap();
        r.unregister(&path).unwrap();
        assert!(matches!(
            r.unregister(&path).unwrap_err(),
            SchedulerError::JobNotFound { .. }
        ));
    }
}
