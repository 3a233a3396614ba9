//! Method-call surface of the bridge.
//!
//! Decodes `{method, arguments}` calls from the host application, runs the
//! matching bridge invocation and encodes its single result. Malformed
//! arguments never reach the bridge; they produce `false` (or an empty list
//! for `getPrinters`).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::adapter::BleAdapter;
use crate::bridge::Bridge;
use crate::registry::PrinterKind;

/// A method invocation from the host application.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResponse {
    Success(Value),
    NotImplemented,
}

impl MethodResponse {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::NotImplemented => None,
        }
    }
}

/// Run `call` against `bridge`.
pub async fn dispatch<A: BleAdapter>(bridge: &Bridge<A>, call: &MethodCall) -> MethodResponse {
    tracing::debug!(method = %call.method, "Handling method call");
    let args = &call.arguments;

    let value = match call.method.as_str() {
        "getPlatformVersion" => json!(bridge.platform_version()),
        "isBluetoothEnabled" => json!(bridge.is_bluetooth_enabled().await),
        "checkBluetoothPermissions" => json!(bridge.check_bluetooth_permissions().await),
        "enableBluetooth" => json!(bridge.enable_bluetooth().await),
        "getPrinters" => match printer_kind(args) {
            Some(kind) => json!(bridge.get_printers(kind).await),
            None => {
                tracing::warn!(arguments = %args, "Invalid arguments for getPrinters");
                json!([])
            }
        },
        "connect" => match args.as_str() {
            Some(address) => json!(bridge.connect(address).await),
            None => invalid("connect", args),
        },
        "isConnected" => json!(bridge.is_connected().await),
        "disconnect" => json!(bridge.disconnect().await),
        "writebytes" => match serde_json::from_value::<Vec<u8>>(args.clone()) {
            Ok(bytes) => json!(bridge.write_bytes(&bytes).await),
            Err(_) => invalid("writebytes", args),
        },
        "printstring" => match args.as_str() {
            Some(text) => json!(bridge.print_string(text).await),
            None => invalid("printstring", args),
        },
        other => {
            tracing::debug!(method = other, "Method not implemented");
            return MethodResponse::NotImplemented;
        }
    };

    MethodResponse::Success(value)
}

fn printer_kind(args: &Value) -> Option<PrinterKind> {
    let raw = args.get("printerType")?;
    serde_json::from_value(raw.clone()).ok()
}

fn invalid(method: &str, args: &Value) -> Value {
    tracing::warn!(method, arguments = %args, "Invalid arguments");
    Value::Bool(false)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapter::PeripheralId;
    use crate::config::BridgeConfig;
    use crate::testing::MockAdapter;

    async fn bridge() -> (Arc<MockAdapter>, Bridge<MockAdapter>) {
        let adapter = Arc::new(MockAdapter::new());
        let (bridge, _pump) = Bridge::start(Arc::clone(&adapter), BridgeConfig::default())
            .await
            .unwrap();
        (adapter, bridge)
    }

    async fn call(bridge: &Bridge<MockAdapter>, method: &str, arguments: Value) -> MethodResponse {
        dispatch(bridge, &MethodCall::new(method, arguments)).await
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_method_is_not_implemented() {
        let (_, bridge) = bridge().await;
        assert_eq!(
            call(&bridge, "cutPaper", Value::Null).await,
            MethodResponse::NotImplemented
        );
    }

    #[tokio::test(start_paused = true)]
    async fn static_queries() {
        let (_, bridge) = bridge().await;
        assert_eq!(
            call(&bridge, "enableBluetooth", Value::Null).await,
            MethodResponse::Success(json!(false))
        );
        assert_eq!(
            call(&bridge, "isBluetoothEnabled", Value::Null).await,
            MethodResponse::Success(json!(true))
        );
        assert_eq!(
            call(&bridge, "isConnected", Value::Null).await,
            MethodResponse::Success(json!(false))
        );
        let version = call(&bridge, "getPlatformVersion", Value::Null).await;
        assert!(version.value().unwrap().is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn get_printers_decodes_printer_type() {
        let (adapter, bridge) = bridge().await;
        adapter.advertise(PeripheralId::Mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]), Some("Printer1"));

        assert_eq!(
            call(&bridge, "getPrinters", json!({ "printerType": "usb" })).await,
            MethodResponse::Success(json!([]))
        );
        assert_eq!(
            call(&bridge, "getPrinters", json!({ "printerType": "serial" })).await,
            MethodResponse::Success(json!([]))
        );
        assert_eq!(
            call(&bridge, "getPrinters", Value::Null).await,
            MethodResponse::Success(json!([]))
        );

        assert_eq!(
            call(&bridge, "getPrinters", json!({ "printerType": "bluethoot" })).await,
            MethodResponse::Success(json!([{
                "name": "Printer1",
                "bleAddress": "AA:BB:CC:DD:EE:FF",
                "type": "bluethoot",
                "isConnected": false,
            }]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_arguments_yield_false() {
        let (adapter, bridge) = bridge().await;
        for (method, arguments) in [
            ("connect", json!(42)),
            ("connect", json!("not-a-uuid")),
            ("writebytes", json!("abc")),
            ("writebytes", json!([1, 2, 300])),
            ("printstring", json!(["a"])),
        ] {
            assert_eq!(
                call(&bridge, method, arguments).await,
                MethodResponse::Success(json!(false)),
                "{method} should fail"
            );
        }
        assert!(adapter.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_write_disconnect_round() {
        let (adapter, bridge) = bridge().await;
        let id = PeripheralId::Mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        adapter.add_peripheral(id);

        assert_eq!(
            call(&bridge, "connect", json!("AA:BB:CC:DD:EE:FF")).await,
            MethodResponse::Success(json!(true))
        );
        for _ in 0..100 {
            if bridge.is_ready().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        assert_eq!(
            call(&bridge, "writebytes", json!([27, 64, 10])).await,
            MethodResponse::Success(json!(true))
        );
        assert_eq!(
            call(&bridge, "printstring", json!("Total: 9,90\n")).await,
            MethodResponse::Success(json!(true))
        );
        assert_eq!(
            adapter.writes(),
            vec![vec![27, 64, 10], b"Total: 9,90\n".to_vec()]
        );

        assert_eq!(
            call(&bridge, "disconnect", Value::Null).await,
            MethodResponse::Success(json!(true))
        );
        assert_eq!(
            call(&bridge, "disconnect", Value::Null).await,
            MethodResponse::Success(json!(false))
        );
    }

    #[test]
    fn method_call_arguments_are_optional() {
        let call: MethodCall = serde_json::from_str(r#"{"method":"isConnected"}"#).unwrap();
        assert_eq!(call.arguments, Value::Null);
    }
}
