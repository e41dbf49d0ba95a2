use clap::{Parser, Subcommand};
use nova_passthrough::{
    DomainHandle, PassthroughError, Result,
    config::PassthroughConfig,
    logger,
    pci::{BindingState, DriverName, PciAddress},
    rebinder::BindingRecord,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "nova-passthrough")]
#[command(about = "Move GPU IOMMU groups between host drivers and vfio-pci")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to passthrough configuration (default: ~/.config/nova/passthrough.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List PCI functions with driver and IOMMU group
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show the group that moves together with a GPU
    Group {
        /// PCI address of the GPU (e.g., 0000:01:00.0)
        device: String,
        #[arg(long)]
        json: bool,
    },
    /// Bind a GPU's whole group to vfio-pci
    Bind {
        /// PCI address of the GPU
        device: String,
        /// Terminate processes holding the device open
        #[arg(long)]
        authorize_kill: bool,
    },
    /// Return a GPU's group to host drivers
    Restore {
        /// PCI address of the GPU
        device: String,
        /// Original driver of a function, e.g. 0000:01:00.0=nvidia (probe otherwise)
        #[arg(long = "driver", value_parser = parse_driver_pair)]
        drivers: Vec<(PciAddress, DriverName)>,
    },
    /// Run a libvirt VM with its GPU passed through, restoring it afterwards
    Run {
        /// libvirt domain name
        vm_name: String,
        /// PCI address of the GPU (falls back to config, then domain hostdevs)
        #[arg(long)]
        gpu: Option<String>,
        #[arg(long)]
        authorize_kill: bool,
    },
}

fn parse_driver_pair(value: &str) -> std::result::Result<(PciAddress, DriverName), String> {
    let (address, driver) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ADDR=DRIVER, got '{}'", value))?;
    let address = address.parse().map_err(|e: PassthroughError| e.to_string())?;
    let driver = DriverName::parse(driver).map_err(|e| e.to_string())?;
    Ok((address, driver))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "nova_passthrough=debug");
        }
    }
    logger::init_logger();

    let config_path = cli.config.clone().unwrap_or_else(PassthroughConfig::default_path);
    let config = PassthroughConfig::load_or_default(&config_path)?;
    logger::debug!("Passthrough config: {}", config_path.display());

    match cli.command {
        Commands::List { json } => {
            let inventory = config.inventory();
            let functions = inventory.list_functions()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&functions)?);
                return Ok(());
            }
            if !inventory.iommu_enabled() {
                println!("⚠️  IOMMU groups not found; enable intel_iommu=on or amd_iommu=on");
            }

            println!("{:<14} {:<11} {:<8} {:<12} {:<16}", "PCI ADDRESS", "ID", "CLASS", "IOMMU GROUP", "DRIVER");
            println!("{}", "=".repeat(65));
            for function in functions {
                let group = function
                    .iommu_group
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let driver = function.driver.as_ref().map(|d| d.as_str()).unwrap_or("-");
                println!(
                    "{:<14} {:<11} {:<8} {:<12} {:<16}",
                    function.address,
                    function.id.to_string(),
                    format!("{:06x}", function.class),
                    group,
                    driver
                );
            }
        }
        Commands::Group { device, json } => {
            let gpu: PciAddress = device.parse()?;
            let group = config.resolver().resolve_group(&gpu)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&group)?);
                return Ok(());
            }

            println!("{}", group);
            let inventory = config.inventory();
            for function in group.functions() {
                let state = inventory.binding_state(&function.address)?;
                let marker = if function.boot_vga { " (boot VGA)" } else { "" };
                println!("  {} {} {}{}", function.address, function.id, state, marker);
            }
        }
        Commands::Bind {
            device,
            authorize_kill,
        } => {
            let gpu: PciAddress = device.parse()?;
            let group = config.resolver().resolve_group(&gpu)?;
            let exec = config.executor();

            let released = config
                .reaper(exec.clone())
                .release_holders(&group, authorize_kill)?;
            if released > 0 {
                println!("Terminated {} process(es) holding {}", released, group);
            }

            let record = config.rebinder(exec).bind_to_vfio(&group)?;
            println!("✅ {} bound to vfio-pci", group);
            print_record(&record);
        }
        Commands::Restore { device, drivers } => {
            let gpu: PciAddress = device.parse()?;
            let group = config.resolver().resolve_group(&gpu)?;
            let record = BindingRecord::from_drivers(drivers);

            config.rebinder(config.executor()).restore_host_driver(&group, &record)?;
            println!("✅ {} returned to host drivers", group);
        }
        Commands::Run {
            vm_name,
            gpu,
            authorize_kill,
        } => {
            let vm_config = config.get_vm(&vm_name);
            let gpu = match gpu {
                Some(address) => Some(address.parse()?),
                None => match vm_config {
                    Some(vm) => vm.gpu_address()?,
                    None => None,
                },
            };
            let mut options = vm_config.map(|vm| vm.activate_options()).unwrap_or_default();
            options.authorize_kill |= authorize_kill;

            let hooks = config.hooks();
            let domain = config.domain(&vm_name);

            hooks.start_domain(&domain, gpu, options).await?;
            println!("✅ VM '{}' started", vm_name);

            tokio::select! {
                result = domain.wait_until_inactive(Duration::from_secs(2)) => {
                    result?;
                    println!("VM '{}' shut down, returning GPU to host", vm_name);
                    report_restore(hooks.on_after_stop(&vm_name).await)?;
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("Interrupted, shutting down VM '{}'", vm_name);
                    report_restore(hooks.stop_domain(&domain, false).await)?;
                }
            }
        }
    }

    Ok(())
}

fn print_record(record: &BindingRecord) {
    println!("Original drivers (needed for restore):");
    for (address, state) in &record.original_states {
        match state {
            BindingState::HostDriver(driver) => println!("  --driver {}={}", address, driver),
            other => println!("  {} ({})", address, other),
        }
    }
}

fn report_restore(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            println!("✅ GPU returned to host drivers");
            Ok(())
        }
        Err(err) => {
            eprintln!("⚠️  GPU may remain unavailable to the host: {}", err);
            if err.requires_manual_intervention() {
                eprintln!("   Manual intervention required before the device can be reused.");
            }
            Err(err)
        }
    }
}
