//! Dispatches a single `Effect::render` call according to the node's declared
//! thread safety (spec §6 `EffectSafety`). `FullySafe` and `HostTiled` nodes
//! may be invoked from multiple tiles concurrently; `InstanceSafe` nodes are
//! serialized through a per-instance mutex, since the plugin only promises
//! correctness for one in-flight `render` per node instance. `Unsafe` nodes
//! are serialized through a per-*plugin* mutex instead: two node instances of
//! the same unsafe plugin must never run concurrently, so graph builders that
//! instantiate the same plugin more than once must hand every one of those
//! dispatchers the same `plugin_lock` via `with_plugin_lock`.

use std::sync::{Arc, Mutex};

use render_protocol::{Effect, EffectSafety, RenderInvocation, RenderStatus};

pub struct TileDispatcher {
    instance_lock: Mutex<()>,
    plugin_lock: Arc<Mutex<()>>,
}

impl TileDispatcher {
    /// A dispatcher for a node whose plugin has no other live instance in the
    /// graph; it gets its own fresh plugin-wide lock.
    pub fn new() -> Self {
        Self::with_plugin_lock(Arc::new(Mutex::new(())))
    }

    /// A dispatcher sharing `plugin_lock` with every other node instance of
    /// the same plugin, so an `Unsafe` effect's renders are serialized across
    /// all of them rather than just this one node.
    pub fn with_plugin_lock(plugin_lock: Arc<Mutex<()>>) -> Self {
        Self {
            instance_lock: Mutex::new(()),
            plugin_lock,
        }
    }

    pub fn invoke(&self, effect: &dyn Effect, invocation: &mut RenderInvocation<'_>) -> RenderStatus {
        match effect.safety() {
            EffectSafety::FullySafe | EffectSafety::HostTiled => effect.render(invocation),
            EffectSafety::InstanceSafe => {
                let _guard = self.instance_lock.lock().expect("tile dispatcher instance mutex poisoned");
                effect.render(invocation)
            }
            EffectSafety::Unsafe => {
                let _guard = self.plugin_lock.lock().expect("tile dispatcher plugin mutex poisoned");
                effect.render(invocation)
            }
        }
    }
}

impl Default for TileDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
