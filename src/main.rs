use clap::{Args, Parser, Subcommand};
use rcon::cli::{self, RunOptions};
use rcon::{APP_NAME, DEFAULT_AUTH_FILE, DEFAULT_CACHE_DIR, DEFAULT_RUN_DIR, VERSION};

#[derive(Parser)]
#[command(name = APP_NAME)]
#[command(version = VERSION)]
#[command(about = "Simple and limited container runner")]
#[command(
    long_about = "A dead simple and somewhat naive container runner.\n\n\
                  The focus is on a runtime which can work with older kernels where \
                  podman won't work. This comes at a cost but in some cases the \
                  trade-off is probably worth it."
)]
struct Cli {
    /// enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// disable logging
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// image reference to run
    image: String,

    /// command and arguments (defaults to the image's Entrypoint/Cmd)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    cmd: Vec<String>,

    /// folder for per-run container roots
    #[arg(long, default_value = DEFAULT_RUN_DIR)]
    run_dir: String,

    /// cache folder for images
    #[arg(long, default_value = DEFAULT_CACHE_DIR)]
    cache_dir: String,

    /// auth file (json) for accessing container registry
    #[arg(long, default_value = DEFAULT_AUTH_FILE)]
    auth_file: String,

    /// ignore a cached image and fetch again
    #[arg(long)]
    skip_cache: bool,

    /// mount spec: host:container (bind) or container:tmpfs:bytes
    #[arg(long = "mount")]
    mounts: Vec<String>,

    /// KEY=VALUE to set, or KEY to inherit from the current environment
    #[arg(long = "env")]
    envs: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the container based on options passed in
    Run(RunArgs),

    /// Fetch the provided container ref and store it in cache
    Fetch {
        /// image reference to fetch
        image: String,

        /// cache folder for images
        #[arg(long, default_value = DEFAULT_CACHE_DIR)]
        cache_dir: String,

        /// auth file (json) for accessing container registry
        #[arg(long, default_value = DEFAULT_AUTH_FILE)]
        auth_file: String,
    },

    /// Register username/secret for the specified registry
    Login {
        /// registry server url
        server_url: String,

        /// specify username. leave blank for tokens
        #[arg(long, default_value = "")]
        username: String,

        /// auth file (json) for accessing container registry
        #[arg(long, default_value = DEFAULT_AUTH_FILE)]
        auth_file: String,
    },

    /// Internal container init (do not use manually)
    #[command(name = "internal-init", hide = true)]
    InternalInit(RunArgs),
}

fn run_options(args: RunArgs, verbose: bool, quiet: bool) -> RunOptions {
    RunOptions {
        image_ref: args.image,
        cmd_args: args.cmd,
        run_dir: args.run_dir,
        cache_dir: args.cache_dir,
        auth_file: args.auth_file,
        skip_cache: args.skip_cache,
        mounts: args.mounts,
        envs: args.envs,
        verbose,
        quiet,
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        "off"
    } else if verbose {
        "trace"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    // errors past argument parsing are diagnostics, never usage help
    let code = match cli.command {
        Commands::Run(args) => match cli::run(&run_options(args, cli.verbose, cli.quiet)) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("rcon: {}", e);
                1
            }
        },
        Commands::Fetch {
            image,
            cache_dir,
            auth_file,
        } => match cli::fetch_image(&image, &cache_dir, &auth_file) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("rcon: {}", e);
                1
            }
        },
        Commands::Login {
            server_url,
            username,
            auth_file,
        } => match cli::login(&server_url, &username, &auth_file) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("rcon: {}", e);
                1
            }
        },
        Commands::InternalInit(args) => match cli::internal_init(&run_options(args, cli.verbose, cli.quiet)) {
            // internal_init execs on success; reaching here is a failure
            Ok(()) => 1,
            Err(e) => {
                eprintln!("rcon: {}", e);
                1
            }
        },
    };

    std::process::exit(code);
}
