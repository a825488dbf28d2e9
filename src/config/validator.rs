//! Configuration validation

use super::*;
use crate::adapter::{AdapterRegistry, WorkloadRegistry};
use crate::rate::RateControllerRegistry;
use anyhow::Result;

/// Validate complete configuration against the built-in registries
pub fn validate_config(config: &BenchConfig) -> Result<()> {
    validate_with(
        config,
        &AdapterRegistry::default(),
        &WorkloadRegistry::default(),
        &RateControllerRegistry::default(),
    )
}

/// Validate configuration against the given registries
pub fn validate_with(
    config: &BenchConfig,
    adapters: &AdapterRegistry,
    workloads: &WorkloadRegistry,
    rate_controllers: &RateControllerRegistry,
) -> Result<()> {
    validate_clients(&config.clients)?;

    if !adapters.contains(&config.adapter.name) {
        anyhow::bail!("Unknown adapter '{}'", config.adapter.name);
    }

    if config.test.rounds.is_empty() {
        anyhow::bail!("test.rounds must contain at least one round");
    }
    for (i, round) in config.test.rounds.iter().enumerate() {
        validate_round(round, i, workloads, rate_controllers)?;
    }

    Ok(())
}

/// Validate client settings
pub fn validate_clients(clients: &ClientsConfig) -> Result<()> {
    if clients.number == 0 {
        anyhow::bail!("clients.number must be at least 1");
    }

    if clients.mode == ClientMode::Distributed {
        if clients.store.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("clients.store is required in distributed mode");
        }
        if clients.confirmation.is_some() {
            anyhow::bail!("clients.confirmation is only supported in local mode");
        }
    }

    if let Some(command) = &clients.worker_command {
        if command.is_empty() || command[0].is_empty() {
            anyhow::bail!("clients.worker_command must name a program");
        }
    }

    if let Some(confirmation) = &clients.confirmation {
        if confirmation.retry_interval_secs == 0 {
            anyhow::bail!("clients.confirmation.retry_interval_secs must be at least 1");
        }
    }

    crate::distributed::store::validate_path(&clients.root)
        .map_err(|e| anyhow::anyhow!("clients.root: {}", e))?;

    Ok(())
}

/// Validate one test entry
fn validate_round(
    round: &RoundConfig,
    index: usize,
    workloads: &WorkloadRegistry,
    rate_controllers: &RateControllerRegistry,
) -> Result<()> {
    if round.label.is_empty() {
        anyhow::bail!("Round {}: label must not be empty", index);
    }
    let name = &round.label;

    let lengths = match (round.tx_number.is_empty(), round.tx_duration.is_empty()) {
        (false, true) => &round.tx_number,
        (true, false) => &round.tx_duration,
        (false, false) => anyhow::bail!("Round '{}': tx_number and tx_duration are mutually exclusive", name),
        (true, true) => anyhow::bail!("Round '{}': either tx_number or tx_duration is required", name),
    };
    if let Some(pos) = lengths.iter().position(|&n| n == 0) {
        anyhow::bail!("Round '{}': entry {} must be greater than zero", name, pos);
    }

    if !round.rate_control.is_empty() && round.rate_control.len() != lengths.len() {
        anyhow::bail!(
            "Round '{}': rate_control has {} entries but there are {} rounds",
            name,
            round.rate_control.len(),
            lengths.len()
        );
    }
    for spec in &round.rate_control {
        if !rate_controllers.contains(&spec.kind) {
            anyhow::bail!("Round '{}': unknown rate controller '{}'", name, spec.kind);
        }
    }

    if !workloads.contains(&round.callback) {
        anyhow::bail!("Round '{}': unknown callback '{}'", name, round.callback);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::toml::parse_toml_string;

    fn config(rounds: &str) -> BenchConfig {
        let text = format!("[adapter]\nname = \"mock\"\n\n[test]\n{}", rounds);
        parse_toml_string(&text).unwrap()
    }

    const VALID: &str = r#"
[[test.rounds]]
label = "open"
tx_number = [10, 20]
rate_control = [{ type = "fixed-rate", opts = { tps = 5 } }, { type = "linear-rate" }]
callback = "simple-open"
"#;

    #[test]
    fn test_valid_config() {
        validate_config(&config(VALID)).unwrap();
    }

    #[test]
    fn test_length_rules() {
        let both = config(
            "[[test.rounds]]\nlabel = \"a\"\ntx_number = [1]\ntx_duration = [1]\ncallback = \"simple-open\"\n",
        );
        assert!(validate_config(&both).unwrap_err().to_string().contains("mutually exclusive"));

        let neither = config("[[test.rounds]]\nlabel = \"a\"\ncallback = \"simple-open\"\n");
        assert!(validate_config(&neither).unwrap_err().to_string().contains("required"));

        let zero = config("[[test.rounds]]\nlabel = \"a\"\ntx_number = [5, 0]\ncallback = \"simple-open\"\n");
        assert!(validate_config(&zero).unwrap_err().to_string().contains("entry 1"));
    }

    #[test]
    fn test_rate_control_count_mismatch() {
        let text = r#"
[[test.rounds]]
label = "a"
tx_number = [1, 2, 3]
rate_control = [{ type = "fixed-rate" }]
callback = "simple-open"
"#;
        let err = validate_config(&config(text)).unwrap_err().to_string();
        assert!(err.contains("1 entries but there are 3 rounds"), "{}", err);
    }

    #[test]
    fn test_unknown_names() {
        let mut bad = config(VALID);
        bad.test.rounds[0].callback = "nope".into();
        assert!(validate_config(&bad).unwrap_err().to_string().contains("unknown callback"));

        let mut bad = config(VALID);
        bad.test.rounds[0].rate_control[0].kind = "warp-speed".into();
        assert!(validate_config(&bad).unwrap_err().to_string().contains("warp-speed"));

        let mut bad = config(VALID);
        bad.adapter.name = "fabric".into();
        assert!(validate_config(&bad).unwrap_err().to_string().contains("Unknown adapter"));
    }

    #[test]
    fn test_clients_rules() {
        let mut cfg = config(VALID);
        cfg.clients.number = 0;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = config(VALID);
        cfg.clients.mode = ClientMode::Distributed;
        assert!(validate_config(&cfg).unwrap_err().to_string().contains("clients.store"));
        cfg.clients.store = Some("127.0.0.1:2181".into());
        validate_config(&cfg).unwrap();

        let mut cfg = config(VALID);
        cfg.clients.root = "caliper".into();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_empty_rounds() {
        let cfg = config("rounds = []\n");
        assert!(validate_config(&cfg).unwrap_err().to_string().contains("at least one round"));
    }
}
