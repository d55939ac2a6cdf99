//! Output buffers owned by a server instance: one per job, one per deployment instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::output::buffer::OutputBuffer;
use crate::output::{LogLine, OutputLine};

/// Terminal output of jobs, keyed by job id.
#[derive(Debug)]
pub struct OutputRegistry {
    buffers: RwLock<HashMap<String, Arc<OutputBuffer<OutputLine>>>>,
    capacity: usize,
}

impl OutputRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn get_or_create(&self, job_id: &str) -> Arc<OutputBuffer<OutputLine>> {
        if let Some(buffer) = self.buffers.read().get(job_id) {
            return Arc::clone(buffer);
        }
        let mut buffers = self.buffers.write();
        Arc::clone(
            buffers
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(OutputBuffer::new(self.capacity))),
        )
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<OutputBuffer<OutputLine>>> {
        self.buffers.read().get(job_id).cloned()
    }

    /// Close the job's buffer so observers drain it and finish.
    pub fn close(&self, job_id: &str) {
        if let Some(buffer) = self.get(job_id) {
            buffer.close();
        }
    }

    pub fn remove(&self, job_id: &str) {
        if let Some(buffer) = self.buffers.write().remove(job_id) {
            buffer.close();
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Instance {
    deployment_id: String,
    buffer: Arc<OutputBuffer<LogLine>>,
}

/// Log buffers of running deployment instances.
#[derive(Debug)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Instance>>,
    capacity: usize,
    changed: watch::Sender<u64>,
}

impl InstanceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            capacity,
            changed: watch::channel(0).0,
        }
    }

    /// Buffer for `instance_id`, created (or replaced, if the previous one was closed) on demand.
    pub fn register(&self, instance_id: &str, deployment_id: &str) -> Arc<OutputBuffer<LogLine>> {
        let buffer = {
            let mut instances = self.instances.write();
            match instances.get(instance_id) {
                Some(existing)
                    if !existing.buffer.is_closed() && existing.deployment_id == deployment_id =>
                {
                    return Arc::clone(&existing.buffer);
                }
                _ => {}
            }
            let buffer = Arc::new(OutputBuffer::new(self.capacity));
            instances.insert(
                instance_id.to_string(),
                Instance {
                    deployment_id: deployment_id.to_string(),
                    buffer: Arc::clone(&buffer),
                },
            );
            buffer
        };
        tracing::debug!(instance_id, deployment_id, "Instance log buffer registered");
        self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
        buffer
    }

    /// Close and forget the instance's buffer. Readers already holding it still drain it.
    pub fn deregister(&self, instance_id: &str) {
        let removed = self.instances.write().remove(instance_id);
        if let Some(instance) = removed {
            instance.buffer.close();
            tracing::debug!(instance_id, "Instance log buffer closed");
            self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
        }
    }

    /// Buffers of every instance of `deployment_id`, ordered by instance id.
    pub fn for_deployment(&self, deployment_id: &str) -> Vec<(String, Arc<OutputBuffer<LogLine>>)> {
        let mut found: Vec<_> = self
            .instances
            .read()
            .iter()
            .filter(|(_, instance)| instance.deployment_id == deployment_id)
            .map(|(id, instance)| (id.clone(), Arc::clone(&instance.buffer)))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Fires whenever an instance is registered or deregistered.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn job_buffers_are_shared_per_id() {
        let registry = OutputRegistry::new(16);
        let a = registry.get_or_create("job-1");
        let b = registry.get_or_create("job-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.remove("job-1");
        assert!(a.is_closed());
        assert!(registry.get("job-1").is_none());
    }

    #[test]
    fn instances_are_grouped_by_deployment() {
        let registry = InstanceRegistry::new(16);
        let mut changes = registry.subscribe();
        registry.register("i-2", "d1");
        registry.register("i-1", "d1");
        registry.register("i-3", "d2");
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        let ids: Vec<String> = registry
            .for_deployment("d1")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["i-1", "i-2"]);

        let buffer = registry.register("i-1", "d1");
        buffer.write(LogLine {
            timestamp: Utc::now(),
            instance_id: "i-1".into(),
            line: "hello".into(),
        });
        registry.deregister("i-1");
        assert!(buffer.is_closed());
        assert!(changes.has_changed().unwrap());
        assert_eq!(registry.for_deployment("d1").len(), 1);
    }
}
