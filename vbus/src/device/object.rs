//! Device exposing host-defined methods over RPC.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use super::{Device, DeviceId, RpcObject};
use crate::error::Fault;

/// Callback backing one RPC method.
pub type RpcHandler = Box<dyn Fn(&[Value]) -> Result<Value, Fault> + Send + Sync>;

/// Device whose RPC methods are closures registered by the host.
///
/// ```
/// use vbus::{DeviceId, ObjectDevice};
///
/// let dev = ObjectDevice::new(DeviceId(9), "redstone")
///     .method("getInput", |_| Ok(serde_json::json!(15)));
/// ```
pub struct ObjectDevice {
    id: DeviceId,
    type_name: String,
    energy_draw: i32,
    methods: BTreeMap<String, RpcHandler>,
}

impl ObjectDevice {
    /// Creates a device answering to `type_name` with no methods.
    pub fn new(id: DeviceId, type_name: impl Into<String>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            energy_draw: 0,
            methods: BTreeMap::new(),
        }
    }

    /// Registers a method.
    #[must_use]
    pub fn method(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&[Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Box::new(handler));
        self
    }

    /// Sets the per-tick energy draw.
    #[must_use]
    pub const fn with_energy_draw(mut self, draw: i32) -> Self {
        self.energy_draw = draw;
        self
    }
}

impl fmt::Debug for ObjectDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDevice")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RpcObject for ObjectDevice {
    fn type_names(&self) -> Vec<String> {
        vec![self.type_name.clone()]
    }

    fn methods(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, Fault> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| Fault::new(format!("no such method: {method}")))?;
        handler(args)
    }
}

impl Device for ObjectDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn kind(&self) -> &str {
        "object"
    }

    fn energy_draw(&self) -> i32 {
        self.energy_draw
    }

    fn rpc(&self) -> Option<&dyn RpcObject> {
        Some(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn dispatches_by_method_name() {
        let dev = ObjectDevice::new(DeviceId(3), "sum").method("add", |args| {
            let total: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(total))
        });

        assert_eq!(dev.methods(), vec!["add".to_owned()]);
        assert_eq!(dev.invoke("add", &[json!(2), json!(40)]).unwrap(), json!(42));
        assert!(dev.invoke("sub", &[]).is_err());
        assert_eq!(dev.size(), 0);
    }
}
