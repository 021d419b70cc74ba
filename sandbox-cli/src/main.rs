use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use sandbox_core::blueprint::Blueprint;
use sandbox_core::config::{BucketName, DeployConfig, ProfileBinding};
use sandbox_core::sequencer::{CancelFlag, Sequencer};
use sandbox_core::teardown::{Teardown, TeardownOptions, TeardownPlan};
use sandbox_core::template::{self, DEFAULT_BOOTSTRAP};

use sandbox_provider_aws::AwsProvider;

#[derive(Parser)]
#[command(name = "sandbox")]
#[command(about = "Provision a small AWS connectivity sandbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or find) every resource of the sandbox
    Deploy {
        #[command(flatten)]
        config: ConfigArgs,

        /// Print the deployment identifiers as JSON
        #[arg(long)]
        json: bool,
    },
    /// Destroy every resource of the sandbox, in reverse order
    Destroy {
        #[command(flatten)]
        config: ConfigArgs,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,

        /// Also empty and delete the bucket
        #[arg(long)]
        delete_bucket: bool,

        /// Leave the local private-key file in place
        #[arg(long)]
        keep_key_file: bool,
    },
    /// Print the rendered bootstrap script
    Render {
        #[command(flatten)]
        config: ConfigArgs,

        /// Bucket name to render (required when the bucket name is generated)
        #[arg(long)]
        bucket: Option<String>,
    },
    /// Validate the configuration
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Configuration sources: JSON file first, then flags and environment
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// Path to a JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Name prefix for every resource
    #[arg(long, env = "SANDBOX_PREFIX")]
    prefix: Option<String>,

    #[arg(long)]
    vpc_cidr: Option<String>,

    #[arg(long)]
    public_subnet_cidr: Option<String>,

    #[arg(long, conflicts_with = "no_private_subnet")]
    private_subnet_cidr: Option<String>,

    /// Do not create the private subnet
    #[arg(long)]
    no_private_subnet: bool,

    /// Leave the private subnet without a NAT gateway route
    #[arg(long)]
    no_nat_gateway: bool,

    #[arg(long)]
    availability_zone: Option<String>,

    /// Explicit bucket name; "generate" for `<prefix>-<random>`
    #[arg(long)]
    bucket_name: Option<String>,

    #[arg(long)]
    image_id: Option<String>,

    #[arg(long)]
    instance_type: Option<String>,

    /// Where the private key is written
    #[arg(long)]
    key_path: Option<PathBuf>,

    /// at-launch, associate or none
    #[arg(long)]
    profile_binding: Option<ProfileBinding>,

    /// Bootstrap template replacing the bundled script
    #[arg(long)]
    template: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<DeployConfig, String> {
        let mut config = match self.config {
            Some(ref path) => DeployConfig::from_json_file(path).map_err(|e| e.to_string())?,
            None => DeployConfig::default(),
        };

        if let Some(ref region) = self.region {
            config.region = region.clone();
        }
        if let Some(ref prefix) = self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(ref cidr) = self.vpc_cidr {
            config.vpc_cidr = cidr.clone();
        }
        if let Some(ref cidr) = self.public_subnet_cidr {
            config.public_subnet_cidr = cidr.clone();
        }
        if let Some(ref cidr) = self.private_subnet_cidr {
            config.private_subnet_cidr = Some(cidr.clone());
        }
        if self.no_private_subnet {
            config.private_subnet_cidr = None;
        }
        if self.no_nat_gateway {
            config.nat_gateway = false;
        }
        if let Some(ref zone) = self.availability_zone {
            config.availability_zone = Some(zone.clone());
        }
        if let Some(ref name) = self.bucket_name {
            config.bucket = BucketName::from(name.clone());
        }
        if let Some(ref image_id) = self.image_id {
            config.image_id = image_id.clone();
        }
        if let Some(ref instance_type) = self.instance_type {
            config.instance_type = instance_type.clone();
        }
        if let Some(ref key_path) = self.key_path {
            config.key_path = Some(key_path.clone());
        }
        if let Some(binding) = self.profile_binding {
            config.profile_binding = binding;
        }

        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    fn template(&self) -> Result<String, String> {
        match self.template {
            Some(ref path) => fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e)),
            None => Ok(DEFAULT_BOOTSTRAP.to_string()),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Deploy { config, json } => run_deploy(&config, json).await,
        Commands::Destroy {
            config,
            auto_approve,
            delete_bucket,
            keep_key_file,
        } => {
            let options = TeardownOptions {
                delete_bucket,
                remove_key_file: !keep_key_file,
            };
            run_destroy(&config, options, auto_approve).await
        }
        Commands::Render { config, bucket } => run_render(&config, bucket.as_deref()),
        Commands::Validate { config } => run_validate(&config),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Cancel at the next stage boundary on Ctrl-C; a second Ctrl-C exits at once
fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, &flag).await {
            std::process::exit(130);
        }
    });
    cancel
}

/// Returns true once a second interrupt arrives after the first one cancelled the run
async fn watch_interrupts<F, Fut>(mut next_signal: F, cancel: &CancelFlag) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if next_signal().await.is_err() {
        return false;
    }
    eprintln!(
        "\n{}",
        "Interrupted; stopping after the current stage. Press Ctrl-C again to exit now.".yellow()
    );
    cancel.cancel();

    if next_signal().await.is_err() {
        return false;
    }
    eprintln!("{}", "Interrupted again; exiting.".red());
    true
}

fn run_validate(args: &ConfigArgs) -> Result<(), String> {
    let config = args.load()?;
    let template = args.template()?;
    let variables = template::variables(&template).map_err(|e| e.to_string())?;

    println!("{}", "✓ Configuration is valid.".green().bold());
    println!();
    println!("  region:          {}", config.region);
    println!("  prefix:          {}", config.prefix);
    println!("  vpc:             {}", config.vpc_cidr);
    println!("  public subnet:   {}", config.public_subnet_cidr);
    match config.private_subnet_cidr {
        Some(ref cidr) => println!("  private subnet:  {}", cidr),
        None => println!("  private subnet:  {}", "none".dimmed()),
    }
    if config.uses_nat_gateway() {
        println!("  nat gateway:     yes");
    } else {
        println!("  nat gateway:     {}", "no".dimmed());
    }
    match config.bucket {
        BucketName::Generate => println!("  bucket:          {}", "generated".dimmed()),
        BucketName::Named(ref name) => println!("  bucket:          {}", name),
    }
    println!("  profile binding: {}", config.profile_binding);
    println!("  template vars:   {}", variables.join(", "));
    Ok(())
}

fn run_render(args: &ConfigArgs, bucket: Option<&str>) -> Result<(), String> {
    let config = args.load()?;
    let template = args.template()?;

    let bucket = match (bucket, &config.bucket) {
        (Some(name), _) => name.to_string(),
        (None, BucketName::Named(name)) => name.clone(),
        (None, BucketName::Generate) => {
            return Err("--bucket is required when the bucket name is generated".to_string());
        }
    };

    let bindings = Blueprint::new(&config).template_bindings(&bucket);
    let rendered = template::render(&template, &bindings).map_err(|e| e.to_string())?;

    std::io::stdout()
        .write_all(&rendered)
        .map_err(|e| e.to_string())
}

async fn run_deploy(args: &ConfigArgs, json: bool) -> Result<(), String> {
    let config = args.load()?;
    let template = args.template()?;

    let provider = AwsProvider::new(&config.region).await;
    let sequencer = Sequencer::new(&provider)
        .with_cancel(cancel_on_ctrl_c())
        .with_template(template);

    println!(
        "{}",
        format!("Deploying sandbox '{}' to {}...", config.prefix, config.region).bold()
    );
    println!();

    let result = sequencer.deploy(&config).await.map_err(|e| e.to_string())?;

    if json {
        let out = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }

    for (label, id) in result.identifiers() {
        println!("  {} {:<22} {}", "✓".green(), label, id);
    }
    println!();

    if result.created.is_empty() {
        println!(
            "{}",
            "No changes. Every resource already exists.".green().bold()
        );
    } else {
        println!(
            "{}",
            format!(
                "Deploy complete! {} resources created.",
                result.created.len()
            )
            .green()
            .bold()
        );
        for id in &result.created {
            println!("  {} {}", "+".green(), id);
        }
    }
    Ok(())
}

fn print_plan(plan: &TeardownPlan) {
    println!("{}", "Destroy Plan:".red().bold());
    println!();

    for deletion in &plan.deletions {
        println!(
            "  {} {} ({})",
            "-".red().bold(),
            deletion.id,
            deletion.resource.id.dimmed()
        );
    }
    if let Some(ref path) = plan.key_file {
        println!("  {} key file {}", "-".red().bold(), path.display());
    }

    println!();
    println!(
        "Plan: {} to destroy.",
        plan.deletions.len().to_string().red()
    );
    println!();
}

async fn run_destroy(
    args: &ConfigArgs,
    options: TeardownOptions,
    auto_approve: bool,
) -> Result<(), String> {
    let config = args.load()?;

    let provider = AwsProvider::new(&config.region).await;
    let teardown = Teardown::new(&provider).with_cancel(cancel_on_ctrl_c());

    let plan = teardown
        .plan(&config, options)
        .await
        .map_err(|e| e.to_string())?;

    if plan.is_empty() {
        println!("{}", "No resources to destroy.".green());
        return Ok(());
    }

    print_plan(&plan);

    // Confirmation prompt
    if !auto_approve {
        println!(
            "{}",
            "Do you really want to destroy all resources?"
                .yellow()
                .bold()
        );
        println!(
            "  {}",
            "This action cannot be undone. Type 'yes' to confirm.".yellow()
        );
        print!("\n  Enter a value: ");
        std::io::stdout().flush().map_err(|e| e.to_string())?;

        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(|e| e.to_string())?;

        if input.trim() != "yes" {
            println!();
            println!("{}", "Destroy cancelled.".yellow());
            return Ok(());
        }
        println!();
    }

    println!("{}", "Destroying resources...".red().bold());
    println!();

    match teardown.execute(&plan).await {
        Ok(report) => {
            for id in &report.deleted {
                println!("  {} {}", "✓".green(), id);
            }
            if let Some(ref path) = report.removed_key_file {
                println!("  {} key file {}", "✓".green(), path.display());
            }
            println!();
            println!(
                "{}",
                format!(
                    "Destroy complete! {} resources destroyed.",
                    report.deleted.len()
                )
                .green()
                .bold()
            );
            Ok(())
        }
        Err(failure) => {
            println!("  {} {}", "✗".red(), failure);
            Err(format!("Destroy failed at stage {}", failure.stage))
        }
    }
}
