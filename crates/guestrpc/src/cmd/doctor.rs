use guestrpc_rpci::send_one_with_config;
use serde::Serialize;

use crate::backend::ChannelOpts;
use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: &'static str,
    simulated: bool,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, opts: &ChannelOpts, format: OutputFormat) -> CliResult<i32> {
    let mut checks = vec![platform_arch_check(), hypervisor_check()];

    let backdoor = backdoor_probe_check(&checks);
    let backdoor_ok = backdoor.status == CheckStatus::Pass;
    checks.push(backdoor);
    checks.push(rpci_roundtrip_check(opts, backdoor_ok));
    checks.push(compiled_features_check());

    let has_fail = checks.iter().any(|c| c.status == CheckStatus::Fail);
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput {
        schema_id: "guestrpc/cli/v1/doctor-report",
        simulated: opts.simulate,
        checks,
        overall,
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("guestrpc doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<18} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn platform_arch_check() -> CheckResult {
    let arch = std::env::consts::ARCH;
    if cfg!(target_arch = "x86_64") {
        CheckResult::new("platform_arch", CheckStatus::Pass, format!("{arch} backdoor ports available"))
    } else {
        CheckResult::new(
            "platform_arch",
            CheckStatus::Fail,
            format!("backdoor transport not supported on {arch}"),
        )
    }
}

#[cfg(target_arch = "x86_64")]
fn hypervisor_check() -> CheckResult {
    let info = guestrpc_transport::detect_hypervisor();
    if info.is_vmware() {
        CheckResult::new("hypervisor", CheckStatus::Pass, info.vendor)
    } else if info.present {
        CheckResult::new(
            "hypervisor",
            CheckStatus::Fail,
            format!("not VMware (vendor {:?})", info.vendor),
        )
    } else {
        CheckResult::new("hypervisor", CheckStatus::Fail, "no hypervisor detected")
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn hypervisor_check() -> CheckResult {
    CheckResult::new("hypervisor", CheckStatus::Skip, "cpuid unavailable on this platform")
}

/// Probe only after the vendor check passed; the port I/O faults elsewhere.
fn backdoor_probe_check(prior: &[CheckResult]) -> CheckResult {
    if prior.iter().any(|c| c.status != CheckStatus::Pass) {
        return CheckResult::new("backdoor_probe", CheckStatus::Skip, "hypervisor is not VMware");
    }

    // Probing through the shared handle leaves it cached for the roundtrip.
    #[cfg(target_arch = "x86_64")]
    {
        use guestrpc_transport::{PortBackdoor, Transport};

        match Transport::<PortBackdoor>::system() {
            Ok(transport) => CheckResult::new(
                "backdoor_probe",
                CheckStatus::Pass,
                format!("backdoor version {}", transport.lock().version()),
            ),
            Err(err) => CheckResult::new("backdoor_probe", CheckStatus::Fail, err.to_string()),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        CheckResult::new("backdoor_probe", CheckStatus::Skip, "no backdoor on this platform")
    }
}

fn rpci_roundtrip_check(opts: &ChannelOpts, backdoor_ok: bool) -> CheckResult {
    if !opts.simulate && !backdoor_ok {
        return CheckResult::new("rpci_roundtrip", CheckStatus::Skip, "backdoor unavailable");
    }

    let result = opts.open_transport().map_err(|err| err.message).and_then(|transport| {
        send_one_with_config(&transport, "log guestrpc doctor", opts.channel_config())
            .map_err(|err| err.to_string())
    });

    match result {
        Ok(reply) if reply.ok => CheckResult::new("rpci_roundtrip", CheckStatus::Pass, "log accepted"),
        Ok(reply) => CheckResult::new(
            "rpci_roundtrip",
            CheckStatus::Fail,
            format!("host refused: {}", reply.text()),
        ),
        Err(err) => CheckResult::new("rpci_roundtrip", CheckStatus::Fail, err),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "rpci") {
        features.push("rpci");
    }
    if cfg!(feature = "sim") {
        features.push("sim");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }

    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}
