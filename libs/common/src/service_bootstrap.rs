//! Startup banner and service metadata

use tracing::info;

const LOGO: &str = r#"
 ██████╗ ██████╗ ██╗██████╗  ██████╗ ███████╗
 ██╔══██╗██╔══██╗██║██╔══██╗██╔════╝ ██╔════╝
 ██████╔╝██████╔╝██║██║  ██║██║  ███╗█████╗
 ██╔══██╗██╔══██╗██║██║  ██║██║   ██║██╔══╝
 ██████╔╝██║  ██║██║██████╔╝╚██████╔╝███████╗
 ╚═════╝ ╚═╝  ╚═╝╚═╝╚═════╝  ╚═════╝ ╚══════╝
"#;

/// Name, version and one-line description shown at startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }

    /// `BRIDGESRV v0.1.0 - description`
    pub fn headline(&self) -> String {
        format!(
            "{} v{} - {}",
            self.name.to_uppercase(),
            self.version,
            self.description
        )
    }
}

/// Log the logo and headline at INFO
pub fn print_startup_banner(service: &ServiceInfo) {
    info!("{}", LOGO);
    info!(" {}", service.headline());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headline() {
        let info = ServiceInfo::new("bridgesrv", "0.1.0", "Modbus TCP to RTU bridge");
        assert_eq!(info.headline(), "BRIDGESRV v0.1.0 - Modbus TCP to RTU bridge");
    }
}
