//! Composite Manager
//!
//! A runtime object that owns child objects and child managers and fans
//! lifecycle operations and broadcasts out to them. A failing child is
//! logged and skipped; it never stops the fan-out to its siblings.
//!
//! Activation order is self, managers, objects. Deactivation and
//! termination run in reverse: objects, managers, self.

use crate::context::RuntimeContext;
use crate::error::{contain_step, Result, RuntimeError};
use crate::object::{ObjectBehavior, ObjectInfo, RuntimeObject};
use crate::transport::RpcRuntime;
use nix::sys::signal::Signal;
use parking_lot::RwLock;
use plant_types::{Message, ObjectId};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

pub struct Manager {
    object: Arc<RuntimeObject>,
    self_ref: Weak<Manager>,
    objects: RwLock<Vec<Arc<RuntimeObject>>>,
    managers: RwLock<Vec<Arc<Manager>>>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("id", &self.object.id())
            .field("name", &self.object.name())
            .field("objects", &self.objects.read().len())
            .field("managers", &self.managers.read().len())
            .finish()
    }
}

impl Manager {
    pub fn new(
        ctx: &RuntimeContext,
        id: ObjectId,
        name: impl Into<String>,
        behavior: impl ObjectBehavior,
    ) -> Result<Arc<Self>> {
        let object = RuntimeObject::new(ctx, id, name, behavior)?;
        Ok(Arc::new_cyclic(|me| Self {
            object,
            self_ref: me.clone(),
            objects: RwLock::new(Vec::new()),
            managers: RwLock::new(Vec::new()),
        }))
    }

    /// The manager's own object
    pub fn object(&self) -> &Arc<RuntimeObject> {
        &self.object
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    pub fn name(&self) -> &str {
        self.object.name()
    }

    /// Enclosing manager, if any
    pub fn parent(&self) -> Option<Arc<Manager>> {
        self.object.manager()
    }

    /// Add a child object. Adding the same object twice is a no-op.
    pub fn add_object(&self, obj: Arc<RuntimeObject>) -> Result<()> {
        if Arc::ptr_eq(&obj, &self.object) {
            return Err(RuntimeError::configuration(
                format!("{} cannot contain its own object", self.name()),
                Some("objects"),
            ));
        }

        {
            let mut objects = self.objects.write();
            if objects.iter().any(|o| Arc::ptr_eq(o, &obj)) {
                debug!(manager = %self.name(), object = %obj.name(), "Object already attached");
                return Ok(());
            }
            objects.push(obj.clone());
        }

        obj.set_manager(self.self_ref.clone());
        if obj.adapter().is_none() {
            if let Some(rpc) = self.object.adapter() {
                obj.bind_adapter(rpc);
            }
        }
        debug!(manager = %self.name(), object = %obj.name(), id = %obj.id(), "Object attached");
        Ok(())
    }

    /// Add a child manager. Adding the same manager twice is a no-op.
    pub fn add_manager(&self, child: Arc<Manager>) -> Result<()> {
        if self.self_ref.ptr_eq(&Arc::downgrade(&child)) {
            return Err(RuntimeError::configuration(
                format!("{} cannot contain itself", self.name()),
                Some("managers"),
            ));
        }

        {
            let mut managers = self.managers.write();
            if managers.iter().any(|m| Arc::ptr_eq(m, &child)) {
                debug!(manager = %self.name(), child = %child.name(), "Manager already attached");
                return Ok(());
            }
            managers.push(child.clone());
        }

        child.object.set_manager(self.self_ref.clone());
        if let Some(rpc) = self.object.adapter() {
            if child.object.adapter().is_none() {
                child.bind_tree(&rpc);
            }
        }
        debug!(manager = %self.name(), child = %child.name(), "Manager attached");
        Ok(())
    }

    /// Detach and deactivate a child object
    pub fn remove_object(&self, id: ObjectId) -> Option<Arc<RuntimeObject>> {
        let removed = {
            let mut objects = self.objects.write();
            let pos = objects.iter().position(|o| o.id() == id)?;
            objects.remove(pos)
        };
        removed.set_manager(Weak::new());
        if let Err(e) = removed.deactivate() {
            warn!(manager = %self.name(), object = %removed.name(), error = %e, "Deactivate on removal failed");
        }
        Some(removed)
    }

    /// Detach and deactivate a child manager with its whole subtree
    pub fn remove_manager(&self, id: ObjectId) -> Option<Arc<Manager>> {
        let removed = {
            let mut managers = self.managers.write();
            let pos = managers.iter().position(|m| m.id() == id)?;
            managers.remove(pos)
        };
        removed.object.set_manager(Weak::new());
        if let Err(e) = removed.deactivate() {
            warn!(manager = %self.name(), child = %removed.name(), error = %e, "Deactivate on removal failed");
        }
        Some(removed)
    }

    pub fn find_object(&self, id: ObjectId) -> Option<Arc<RuntimeObject>> {
        self.objects.read().iter().find(|o| o.id() == id).cloned()
    }

    pub fn find_manager(&self, id: ObjectId) -> Option<Arc<Manager>> {
        self.managers.read().iter().find(|m| m.id() == id).cloned()
    }

    /// Depth-first lookup by name over the whole subtree, self included
    pub fn deep_find(&self, name: &str) -> Option<Arc<RuntimeObject>> {
        if self.name() == name {
            return Some(self.object.clone());
        }
        if let Some(obj) = self.objects.read().iter().find(|o| o.name() == name) {
            return Some(obj.clone());
        }
        let managers = self.managers.read().clone();
        managers.iter().find_map(|m| m.deep_find(name))
    }

    pub fn objects(&self) -> Vec<Arc<RuntimeObject>> {
        self.objects.read().clone()
    }

    pub fn managers(&self) -> Vec<Arc<Manager>> {
        self.managers.read().clone()
    }

    /// Number of objects in the subtree, managers' own objects included
    pub fn objects_count(&self) -> usize {
        let managers = self.managers.read().clone();
        1 + self.objects.read().len() + managers.iter().map(|m| m.objects_count()).sum::<usize>()
    }

    /// Snapshots of the subtree in activation order, at most `limit` entries
    pub fn all_objects(&self, limit: usize) -> Vec<ObjectInfo> {
        let mut out = Vec::new();
        self.collect_info(limit, &mut out);
        out
    }

    fn collect_info(&self, limit: usize, out: &mut Vec<ObjectInfo>) {
        if out.len() >= limit {
            return;
        }
        out.push(self.object.info());
        for m in self.managers() {
            m.collect_info(limit, out);
        }
        for o in self.objects() {
            if out.len() >= limit {
                return;
            }
            out.push(o.info());
        }
    }

    /// Bind `rpc` to this manager and every descendant
    fn bind_tree(&self, rpc: &Arc<dyn RpcRuntime>) {
        self.object.bind_adapter(rpc.clone());
        for m in self.managers() {
            m.bind_tree(rpc);
        }
        for o in self.objects() {
            o.bind_adapter(rpc.clone());
        }
    }

    /// Propagate this manager's RPC adapter to the whole subtree
    pub fn initialize(&self) -> Result<()> {
        let rpc = self.object.adapter().ok_or_else(|| {
            RuntimeError::configuration(
                format!("{} has no RPC adapter bound", self.name()),
                Some("adapter"),
            )
        })?;
        self.bind_tree(&rpc);
        debug!(manager = %self.name(), objects = self.objects_count(), "Manager tree initialized");
        Ok(())
    }

    /// Activate self, then child managers, then child objects.
    ///
    /// Only a failure of the manager's own object is returned; child
    /// failures are logged.
    pub fn activate(&self) -> Result<()> {
        self.object.activate()?;

        for m in self.managers() {
            if let Err(e) = contain_step(m.name(), "activate", || m.activate()) {
                error!(manager = %self.name(), child = %m.name(), error = %e, "Child manager activation failed");
            }
        }
        for o in self.objects() {
            if let Err(e) = contain_step(o.name(), "activate", || o.activate()) {
                error!(manager = %self.name(), object = %o.name(), error = %e, "Child activation failed");
            }
        }

        info!(manager = %self.name(), objects = self.objects_count(), "Manager activated");
        Ok(())
    }

    /// Deactivate child objects, then child managers, then self
    pub fn deactivate(&self) -> Result<()> {
        for o in self.objects() {
            if let Err(e) = contain_step(o.name(), "deactivate", || o.deactivate()) {
                error!(manager = %self.name(), object = %o.name(), error = %e, "Child deactivation failed");
            }
        }
        for m in self.managers() {
            if let Err(e) = contain_step(m.name(), "deactivate", || m.deactivate()) {
                error!(manager = %self.name(), child = %m.name(), error = %e, "Child manager deactivation failed");
            }
        }
        self.object.deactivate()
    }

    /// Signal-driven stop in deactivation order
    pub fn terminate(&self, signal: Signal) -> Result<()> {
        for o in self.objects() {
            if let Err(e) = contain_step(o.name(), "terminate", || o.terminate(signal)) {
                error!(manager = %self.name(), object = %o.name(), error = %e, "Child termination failed");
            }
        }
        for m in self.managers() {
            if let Err(e) = contain_step(m.name(), "terminate", || m.terminate(signal)) {
                error!(manager = %self.name(), child = %m.name(), error = %e, "Child manager termination failed");
            }
        }
        self.object.terminate(signal)
    }

    /// Deliver `msg` to every object in the subtree exactly once.
    ///
    /// The manager's own object is not a recipient; child managers' objects
    /// are.
    pub fn broadcast(&self, msg: &Message) {
        let msg = Arc::new(msg.clone());
        self.fan_out(&msg);
    }

    fn fan_out(&self, msg: &Arc<Message>) {
        for o in self.objects() {
            o.push(msg.clone());
        }
        for m in self.managers() {
            m.object.push(msg.clone());
            m.fan_out(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{NoopBehavior, ObjectState};
    use plant_config::RuntimeConfig;

    fn ctx() -> RuntimeContext {
        RuntimeContext::local(RuntimeConfig {
            create_threads: false,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    fn object(ctx: &RuntimeContext, id: i64, name: &str) -> Arc<RuntimeObject> {
        RuntimeObject::new(ctx, ObjectId::new(id), name, NoopBehavior).unwrap()
    }

    #[test]
    fn test_add_is_idempotent_and_sets_parent() {
        let ctx = ctx();
        let root = Manager::new(&ctx, ObjectId::new(1), "Root", NoopBehavior).unwrap();
        let obj = object(&ctx, 2, "Pump");

        root.add_object(obj.clone()).unwrap();
        root.add_object(obj.clone()).unwrap();
        assert_eq!(root.objects().len(), 1);
        assert!(Arc::ptr_eq(&obj.manager().unwrap(), &root));

        assert!(root.add_object(root.object().clone()).is_err());
        assert!(root.add_manager(root.clone()).is_err());
    }

    #[test]
    fn test_lookup() {
        let ctx = ctx();
        let root = Manager::new(&ctx, ObjectId::new(1), "Root", NoopBehavior).unwrap();
        let area = Manager::new(&ctx, ObjectId::new(10), "Area", NoopBehavior).unwrap();
        area.add_object(object(&ctx, 11, "Valve")).unwrap();
        root.add_manager(area.clone()).unwrap();
        root.add_object(object(&ctx, 2, "Pump")).unwrap();

        assert_eq!(root.find_object(ObjectId::new(2)).unwrap().name(), "Pump");
        assert!(root.find_object(ObjectId::new(11)).is_none());
        assert_eq!(root.find_manager(ObjectId::new(10)).unwrap().name(), "Area");
        assert_eq!(root.deep_find("Valve").unwrap().id(), ObjectId::new(11));
        assert_eq!(root.deep_find("Root").unwrap().id(), ObjectId::new(1));
        assert!(root.deep_find("Missing").is_none());
        assert_eq!(root.objects_count(), 4);
        assert!(Arc::ptr_eq(&area.parent().unwrap(), &root));

        let names: Vec<_> = root.all_objects(10).into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["Root", "Area", "Valve", "Pump"]);
        assert_eq!(root.all_objects(2).len(), 2);
    }

    #[test]
    fn test_initialize_requires_adapter() {
        let ctx = ctx();
        let root = Manager::new(&ctx, ObjectId::new(1), "Root", NoopBehavior).unwrap();
        let obj = object(&ctx, 2, "Pump");
        root.add_object(obj.clone()).unwrap();

        assert!(matches!(
            root.initialize(),
            Err(RuntimeError::Configuration { .. })
        ));

        root.object().bind_adapter(ctx.rpc().clone());
        root.initialize().unwrap();
        assert!(obj.adapter().is_some());
    }

    struct RefusesActivation;

    impl ObjectBehavior for RefusesActivation {
        fn activate_object(&mut self, _obj: &RuntimeObject) -> anyhow::Result<()> {
            anyhow::bail!("hardware not present")
        }
    }

    #[test]
    fn test_child_failure_does_not_stop_siblings() {
        let ctx = ctx();
        let root = Manager::new(&ctx, ObjectId::new(1), "Root", NoopBehavior).unwrap();
        root.object().bind_adapter(ctx.rpc().clone());
        let broken =
            RuntimeObject::new(&ctx, ObjectId::new(2), "Broken", RefusesActivation).unwrap();
        let healthy = object(&ctx, 3, "Healthy");
        root.add_object(broken.clone()).unwrap();
        root.add_object(healthy.clone()).unwrap();

        root.activate().unwrap();
        assert_eq!(broken.state(), ObjectState::Error);
        assert_eq!(healthy.state(), ObjectState::Active);
        assert!(!ctx.directory().list().contains(&broken.key()));

        root.deactivate().unwrap();
        assert_eq!(healthy.state(), ObjectState::Stopped);
        assert_eq!(root.object().state(), ObjectState::Stopped);
    }

    #[test]
    fn test_remove_object_deactivates() {
        let ctx = ctx();
        let root = Manager::new(&ctx, ObjectId::new(1), "Root", NoopBehavior).unwrap();
        root.object().bind_adapter(ctx.rpc().clone());
        root.add_object(object(&ctx, 2, "Pump")).unwrap();
        root.activate().unwrap();

        let removed = root.remove_object(ObjectId::new(2)).unwrap();
        assert_eq!(removed.state(), ObjectState::Stopped);
        assert!(removed.manager().is_none());
        assert!(root.remove_object(ObjectId::new(2)).is_none());
        root.deactivate().unwrap();
    }
}
