//! The task environment contract.
//!
//! For every launched task the matcher emits a deterministic set of
//! environment variables describing the granted ports, the host, and the
//! owning app. User-supplied environment always overrides a generated
//! variable of the same name. An optional prefix is applied to generated
//! variables, except for a small whitelist that tooling expects verbatim.

use std::collections::BTreeMap;

use fleet_model::{AppSpec, TaskId};

use crate::matching::PortBinding;

/// Longest sanitized label key exported as its own variable.
pub const ENV_KEY_LIMIT: usize = 512;
/// Longest label value exported as its own variable.
pub const ENV_VALUE_LIMIT: usize = 512;

/// Variables never prefixed, regardless of the configured prefix.
const UNPREFIXED: [&str; 1] = ["MESOS_TASK_ID"];
const UNPREFIXED_PREFIXES: [&str; 1] = ["MARATHON_APP_"];

/// Build the full environment for one app task.
///
/// `bindings` is the matcher's positional port selection; container-only
/// slots are `None` and occupy no `PORTn` number.
pub fn task_env(
    app: &AppSpec,
    task_id: &TaskId,
    host: &str,
    bindings: &[Option<PortBinding>],
    env_prefix: Option<&str>,
) -> BTreeMap<String, String> {
    let mut generated: BTreeMap<String, String> = BTreeMap::new();
    let declared = app.declared_ports();

    let mut host_ports: Vec<u16> = Vec::new();
    for (slot, binding) in bindings.iter().enumerate() {
        let Some(binding) = binding else { continue };
        let index = host_ports.len();
        host_ports.push(binding.host_port);

        generated.insert(format!("PORT{index}"), binding.host_port.to_string());

        if let Some(port_decl) = declared.get(slot) {
            // PORT_<declared> names the port the spec asked for: the fixed
            // host port, the container port for mappings, or the granted
            // value for fully dynamic declarations.
            let declared_number = match (port_decl.host_port, port_decl.container_port) {
                (Some(p), _) if p != 0 => p,
                (_, Some(c)) if c != 0 => c,
                _ => binding.host_port,
            };
            generated.insert(
                format!("PORT_{declared_number}"),
                binding.host_port.to_string(),
            );
            if let Some(name) = &port_decl.name {
                generated.insert(
                    format!("PORT_{}", sanitize(name)),
                    binding.host_port.to_string(),
                );
            }
        }
    }

    generated.insert(
        "PORTS".to_string(),
        host_ports.iter().map(u16::to_string).collect::<Vec<_>>().join(","),
    );
    if let Some(first) = host_ports.first() {
        generated.insert("PORT".to_string(), first.to_string());
    }
    generated.insert("HOST".to_string(), host.to_string());

    generated.insert("MESOS_TASK_ID".to_string(), task_id.to_string());
    generated.insert("MARATHON_APP_ID".to_string(), app.id.to_string());
    generated.insert("MARATHON_APP_VERSION".to_string(), app.version.to_rfc3339());
    generated.insert("MARATHON_APP_RESOURCE_CPUS".to_string(), app.resources.cpus.to_string());
    generated.insert("MARATHON_APP_RESOURCE_MEM".to_string(), app.resources.mem.to_string());
    generated.insert("MARATHON_APP_RESOURCE_DISK".to_string(), app.resources.disk.to_string());
    generated.insert("MARATHON_APP_RESOURCE_GPUS".to_string(), app.resources.gpus.to_string());

    let mut exported_keys: Vec<String> = Vec::new();
    for (key, value) in &app.labels {
        let sanitized = sanitize(key);
        if sanitized.len() > ENV_KEY_LIMIT {
            continue;
        }
        exported_keys.push(sanitized.clone());
        if value.len() > ENV_VALUE_LIMIT {
            // The key still shows up in the label list; only the dedicated
            // variable is skipped.
            continue;
        }
        generated.insert(format!("MARATHON_APP_LABEL_{sanitized}"), value.clone());
    }
    generated.insert("MARATHON_APP_LABELS".to_string(), exported_keys.join(" "));

    let mut env: BTreeMap<String, String> = generated
        .into_iter()
        .map(|(key, value)| {
            let prefixed = match env_prefix {
                Some(prefix) if !is_whitelisted(&key) => format!("{prefix}{key}"),
                _ => key,
            };
            (prefixed, value)
        })
        .collect();

    // User environment wins over anything generated.
    for (key, value) in &app.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

fn is_whitelisted(key: &str) -> bool {
    UNPREFIXED.contains(&key) || UNPREFIXED_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Uppercase and replace anything outside `[A-Z0-9_]`.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() || upper.is_ascii_digit() { upper } else { '_' }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::{InstanceId, PathId, PortDefinition, PortProtocol};

    fn binding(port: u16) -> Option<PortBinding> {
        Some(PortBinding { host_port: port, role: "*".to_string() })
    }

    fn app_with_ports() -> AppSpec {
        let mut app = AppSpec::new(PathId::parse("/prod/web").unwrap());
        app.cmd = Some("serve".to_string());
        app.port_definitions = vec![
            PortDefinition {
                port: 8080,
                name: Some("http".to_string()),
                protocol: PortProtocol::Tcp,
                labels: Default::default(),
            },
            PortDefinition::dynamic(),
        ];
        app
    }

    fn task_id(app: &AppSpec) -> TaskId {
        TaskId::for_instance(InstanceId::for_run_spec(app.id.clone()))
    }

    #[test]
    fn test_port_variables() {
        let app = app_with_ports();
        let env = task_env(&app, &task_id(&app), "node-1", &[binding(31080), binding(31081)], None);
        assert_eq!(env["PORT0"], "31080");
        assert_eq!(env["PORT1"], "31081");
        assert_eq!(env["PORT"], "31080");
        assert_eq!(env["PORTS"], "31080,31081");
        assert_eq!(env["PORT_8080"], "31080");
        assert_eq!(env["PORT_HTTP"], "31080");
        // Dynamic declaration mirrors the granted value.
        assert_eq!(env["PORT_31081"], "31081");
        assert_eq!(env["HOST"], "node-1");
    }

    #[test]
    fn test_container_only_slots_keep_numbering() {
        let app = app_with_ports();
        let env = task_env(&app, &task_id(&app), "h", &[None, binding(31000)], None);
        // The first slot is container-only, so the granted port is PORT0.
        assert_eq!(env["PORT0"], "31000");
        assert!(!env.contains_key("PORT1"));
        assert_eq!(env["PORTS"], "31000");
    }

    #[test]
    fn test_app_identity_variables() {
        let app = app_with_ports();
        let id = task_id(&app);
        let env = task_env(&app, &id, "h", &[], None);
        assert_eq!(env["MARATHON_APP_ID"], "/prod/web");
        assert_eq!(env["MESOS_TASK_ID"], id.to_string());
        assert_eq!(env["MARATHON_APP_RESOURCE_CPUS"], "1");
        assert_eq!(env["MARATHON_APP_RESOURCE_MEM"], "128");
    }

    #[test]
    fn test_user_env_overrides_generated() {
        let mut app = app_with_ports();
        app.env.insert("PORT0".to_string(), "override".to_string());
        app.env.insert("CUSTOM".to_string(), "x".to_string());
        let env = task_env(&app, &task_id(&app), "h", &[binding(31080)], None);
        assert_eq!(env["PORT0"], "override");
        assert_eq!(env["CUSTOM"], "x");
    }

    #[test]
    fn test_labels_exported_and_limited() {
        let mut app = app_with_ports();
        app.labels.insert("tier".to_string(), "web".to_string());
        app.labels.insert("long".to_string(), "v".repeat(ENV_VALUE_LIMIT + 1));
        app.labels.insert("x".repeat(ENV_KEY_LIMIT + 1), "v".to_string());
        let env = task_env(&app, &task_id(&app), "h", &[], None);

        assert_eq!(env["MARATHON_APP_LABEL_TIER"], "web");
        // Oversized value: no dedicated variable, key still listed.
        assert!(!env.contains_key("MARATHON_APP_LABEL_LONG"));
        let labels = &env["MARATHON_APP_LABELS"];
        assert!(labels.contains("TIER"));
        assert!(labels.contains("LONG"));
        // Oversized key: fully skipped.
        assert!(!labels.contains(&"X".repeat(ENV_KEY_LIMIT + 1)));
    }

    #[test]
    fn test_prefix_spares_whitelist() {
        let app = app_with_ports();
        let env =
            task_env(&app, &task_id(&app), "h", &[binding(31080)], Some("FLEET_"));
        assert_eq!(env["FLEET_PORT0"], "31080");
        assert_eq!(env["FLEET_HOST"], "h");
        assert!(env.contains_key("MESOS_TASK_ID"));
        assert!(env.contains_key("MARATHON_APP_ID"));
        assert!(!env.contains_key("PORT0"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("my-label.x"), "MY_LABEL_X");
        assert_eq!(sanitize("ok_2"), "OK_2");
    }
}
