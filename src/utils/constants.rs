/// Nextcloud stack service definitions and constants
///
/// Based on the docker-compose.yml service topology

/// Service definition
#[derive(Debug, Clone)]
pub struct Service {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub container_name: &'static str,
    pub dependencies: &'static [&'static str],
    pub volume: Option<&'static str>,
    pub critical: bool, // Critical for serving user traffic
}

/// All services of the stack.
///
/// Order matters: this is also the fixed update order. Cache and database
/// first, auxiliary services next, then the application, web tier, proxy
/// and cron last.
pub const SERVICES: &[Service] = &[
    Service {
        name: "redis",
        display_name: "Redis (Cache)",
        description: "File locking and caching backend",
        container_name: "nextcloud-redis",
        dependencies: &[],
        volume: Some("redis_data"),
        critical: true,
    },
    Service {
        name: "db",
        display_name: "PostgreSQL (Database)",
        description: "Nextcloud database",
        container_name: "nextcloud-db",
        dependencies: &[],
        volume: Some("db_data"),
        critical: true,
    },
    Service {
        name: "imaginary",
        display_name: "Imaginary (Previews)",
        description: "Image preview generation service",
        container_name: "nextcloud-imaginary",
        dependencies: &[],
        volume: None,
        critical: false,
    },
    Service {
        name: "notify-push",
        display_name: "Notify Push",
        description: "Client push notification daemon",
        container_name: "nextcloud-notify-push",
        dependencies: &["db", "redis"],
        volume: None,
        critical: false,
    },
    Service {
        name: "app",
        display_name: "Nextcloud (App)",
        description: "Nextcloud PHP application server",
        container_name: "nextcloud-app",
        dependencies: &["db", "redis"],
        volume: Some("nextcloud_html"),
        critical: true,
    },
    Service {
        name: "web",
        display_name: "Nginx (Web)",
        description: "Static file and fastcgi front-end",
        container_name: "nextcloud-web",
        dependencies: &["app"],
        volume: None,
        critical: true,
    },
    Service {
        name: "proxy",
        display_name: "Caddy (Reverse Proxy)",
        description: "TLS termination and routing",
        container_name: "nextcloud-proxy",
        dependencies: &["web"],
        volume: Some("proxy_certs"),
        critical: false,
    },
    Service {
        name: "cron",
        display_name: "Cron",
        description: "Background job runner",
        container_name: "nextcloud-cron",
        dependencies: &["db", "redis"],
        volume: None,
        critical: false,
    },
];

/// Fixed update order for `update --all` (same as SERVICES declaration order).
pub const UPDATE_ORDER: &[&str] = &[
    "redis",
    "db",
    "imaginary",
    "notify-push",
    "app",
    "web",
    "proxy",
    "cron",
];

/// Services holding database connections, stopped around a database restore.
pub const DB_DEPENDENT_SERVICES: &[&str] = &["app", "cron", "notify-push", "web"];

/// Named volumes included in volume backups.
pub const BACKUP_VOLUMES: &[&str] = &["db_data", "redis_data", "nextcloud_html", "proxy_certs"];

/// Look up a service by name.
pub fn get_service(name: &str) -> Option<&'static Service> {
    SERVICES.iter().find(|s| s.name == name)
}

/// All service names in declaration order.
pub fn service_names() -> Vec<&'static str> {
    SERVICES.iter().map(|s| s.name).collect()
}

/// Services that must be stopped before a volume's content is replaced.
pub fn volume_services(volume: &str) -> &'static [&'static str] {
    match volume {
        "db_data" => &["db", "app", "cron", "notify-push"],
        "redis_data" => &["redis", "app", "notify-push"],
        "nextcloud_html" => &["app", "web", "cron"],
        "proxy_certs" => &["proxy"],
        _ => &[],
    }
}

/// Secrets managed by the secrets store.
pub const SECRET_NAMES: &[&str] = &[
    "postgres_password",
    "redis_password",
    "nextcloud_admin_password",
];

/// Default paths
pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Health check polling
pub const HEALTH_POLL_INTERVAL_SECS: u64 = 5;
pub const HEALTH_TIMEOUT_SECS: u64 = 120;
pub const ROLLBACK_HEALTH_TIMEOUT_SECS: u64 = 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_definitions() {
        assert!(get_service("db").is_some());
        assert!(get_service("app").is_some());
        assert!(get_service("ftp").is_none());
    }

    #[test]
    fn test_update_order_covers_all_services() {
        assert_eq!(UPDATE_ORDER.len(), SERVICES.len());
        for name in UPDATE_ORDER {
            assert!(get_service(name).is_some(), "unknown service {name}");
        }
    }

    #[test]
    fn test_update_order_respects_dependencies() {
        for (i, name) in UPDATE_ORDER.iter().enumerate() {
            let service = get_service(name).unwrap();
            for dep in service.dependencies {
                let dep_pos = UPDATE_ORDER.iter().position(|n| n == dep).unwrap();
                assert!(dep_pos < i, "{name} updated before its dependency {dep}");
            }
        }
    }

    #[test]
    fn test_volume_services() {
        assert!(volume_services("db_data").contains(&"db"));
        assert!(volume_services("unknown_volume").is_empty());
    }
}
