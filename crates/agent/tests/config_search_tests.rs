//! Integration tests for the configuration search path
//!
//! Kept in their own test binary because they change process environment.

#[cfg(target_os = "linux")]
mod search_path {
    use agent::AgentConfig;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_invalid_user_config_is_an_error() {
        let home = TempDir::new().unwrap();
        let config_dir = home.path().join("usb-gatekeeper");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("agent.toml"),
            r#"
[general]
log_level = "verbose"

[storage]
whitelist_path = "/srv/approved/whitelist.json"
"#,
        )
        .unwrap();

        // Only test in this binary, so no other thread reads the environment
        unsafe { std::env::set_var("XDG_CONFIG_HOME", home.path()) };

        assert_eq!(AgentConfig::default_path(), config_dir.join("agent.toml"));
        let err = AgentConfig::load_or_default().unwrap_err();
        assert!(format!("{:#}", err).contains("log level"), "{:#}", err);
    }
}
