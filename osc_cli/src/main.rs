mod cli_client;
mod cli_options;

use std::env::current_dir;
use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use serde::Serialize;

use common::config::load_style::Format;
use common::config::{read_config, FConfig, OscConfig};
use common::err::osc_error::OscError;
use common::err::OResult;
use common::log::tracing_factory::{OutputType, TracingFactory, TracingFactoryOptions};
use common::pretty_util::to_string_pretty;

use crate::cli_client::CliClient;
use crate::cli_options::CliOptions;

#[derive(Parser, Serialize, Debug, Clone)]
#[command(name = "osc_cli")]
#[command(version = "0.0.2")]
#[command(author = "rust-us")]
#[command(about = "MySQL online schema change tool impl with Rust")]
#[command(long_about = None)]
pub(crate) struct CliArgs {
    /// 加载的配置文件路径
    #[arg(short, long, help = "Path to loaded configuration file", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,

    ///////////////////////////////////////////////////
    // Cli Options //
    ///////////////////////////////////////////////////
    /// enable debug info
    #[arg(short, long, help = "enable debug mode", default_value_t = false)]
    pub debug: bool,

    #[arg(short, long, help = "output format: [yaml | json], default Yaml", default_value = "yaml")]
    pub format: String,

    ///////////////////////////////////////////////////
    // MySQL Options //
    ///////////////////////////////////////////////////
    #[arg(long = "socket", help = "mysql unix socket path", value_name = "socket")]
    pub socket: Option<String>,

    #[arg(long = "host", help = "mysql host", value_name = "host")]
    pub host: Option<String>,

    #[arg(long = "port", help = "mysql port, [1-65555]", value_name = "port")]
    pub port: Option<i16>,

    #[arg(short, long = "username", help = "mysql username", value_name = "username")]
    pub username: Option<String>,

    #[arg(short, long = "password", help = "mysql password", value_name = "password")]
    pub password: Option<String>,

    #[arg(long = "database", help = "target database", value_name = "database")]
    pub database: Option<String>,
}

// must declared as private
#[derive(Subcommand, Serialize, Debug, Clone)]
enum Commands {
    /// Full pipeline: shadow copy, change replay, atomic swap.
    Copy {
        /// File with one CREATE TABLE statement per table
        ddl_file: PathBuf,

        #[arg(long, default_value_t = false)]
        allow_new_pk: bool,

        #[arg(long, alias = "unblock-table-creation-without-pk", default_value_t = false)]
        allow_no_pk: bool,

        #[arg(long, default_value_t = false)]
        eliminate_dups: bool,

        #[arg(long, default_value_t = false)]
        fail_for_implicit_conv: bool,

        /// strip the partition clause from the new schema
        #[arg(long, default_value_t = false)]
        rm_partition: bool,

        #[arg(long, default_value_t = false)]
        no_engine_check: bool,

        #[arg(long, default_value_t = false)]
        enable_outfile_compression: bool,

        #[arg(long, value_name = "N")]
        chunk_size: Option<u64>,

        #[arg(long, value_name = "N")]
        max_replay_lag: Option<u64>,

        #[arg(long, value_name = "SQL")]
        additional_where: Option<String>,

        #[arg(long, default_value_t = false)]
        skip_affected_rows_check: bool,

        #[arg(long, default_value_t = false)]
        skip_checksum: bool,

        #[arg(long, value_name = "DIR")]
        hooks_dir: Option<String>,
    },
    /// Run the DDL as-is, no shadow machinery.
    Direct {
        ddl_file: PathBuf,
    },
    /// Drop artifacts left behind by an interrupted run.
    Cleanup {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let format = Format::format(&args.format);

    let config = load_config(&args);
    let mut osc_config = config.get_config();

    let log_opt = TracingFactoryOptions::new(
        args.debug,
        OutputType::LOG,
        osc_config.base.get_log_dir(),
    );
    let log_factory = TracingFactory::init_log_with_options(log_opt);
    if args.debug {
        eprintln!("log_dir: {:?}", log_factory.get_log_dir());
        eprintln!("args: \n{}", to_string_pretty(&format, &args));
    }

    merge(&mut osc_config, &args);

    if args.debug {
        eprintln!("final config: \n{}", to_string_pretty(&format, &osc_config));
    }

    eprintln!();
    eprintln!("╔═╗╔═╗╔═╗  Online Schema Change");
    eprintln!("║ ║╚═╗║    for MySQL, impl with Rust");
    eprintln!("╚═╝╚═╝╚═╝");
    eprintln!();

    let cli_options = CliOptions::new_with_log(args.debug, format);
    let command = args.command.clone();
    let mut client = CliClient::new(cli_options, osc_config);
    client.install_signal_handler();

    match dispatch(&mut client, command).await {
        Ok(()) => exit(0),
        Err(err) => {
            // 单行错误输出, 带 SQLSTATE; 清理摘要已在此前打印
            match err.sql_state() {
                Some(state) => eprintln!("ERROR [SQLSTATE {}]: {}", state, err),
                None => eprintln!("ERROR: {}", err),
            }
            let code = err.exit_code();
            if code == 3 {
                eprintln!("artifacts remain; rerun `osc_cli cleanup` against this instance");
            }
            exit(code);
        }
    }
}

async fn dispatch(client: &mut CliClient, command: Commands) -> OResult<()> {
    match command {
        Commands::Copy { ddl_file, .. } => client.run_copy(&ddl_file).await,
        Commands::Direct { ddl_file } => client.run_direct(&ddl_file).await,
        Commands::Cleanup { force } => client.run_cleanup(force).await,
    }
}

// 加载配置文件， 读取配置
fn load_config(args: &CliArgs) -> FConfig {
    let default_conf = get_config_path(args);

    match default_conf {
        Some(path) if path.exists() => match read_config(&path) {
            Ok(config) => FConfig::new(config),
            Err(err) => {
                eprintln!("ERROR: {}", OscError::Validation(err.to_string()));
                exit(1);
            }
        },
        _ => FConfig::default(),
    }
}

fn get_config_path(args: &CliArgs) -> Option<PathBuf> {
    if args.config.is_some() {
        return Some(args.config.as_ref().unwrap().clone());
    }

    let mut pwd = current_dir().unwrap_or("/".into());
    // ./conf/osc.toml
    pwd.push("conf");
    pwd.push("osc");
    pwd.set_extension("toml");

    Some(pwd)
}

/// CLI arguments win over the config file.
fn merge(config: &mut OscConfig, args: &CliArgs) {
    if args.socket.is_some() {
        config.mysql.socket = args.socket.clone();
    }
    if args.host.is_some() {
        config.mysql.host = args.host.clone();
    }
    if config.mysql.have_host() {
        config.mysql.host = Some("127.0.0.1".to_string());
    }

    if args.port.is_some() {
        config.mysql.port = args.port;
    }
    if config.mysql.have_port() {
        config.mysql.port = Some(3306);
    }

    if let Some(username) = &args.username {
        config.mysql.username = username.clone();
    }
    if let Some(password) = &args.password {
        config.mysql.password = password.clone();
    }
    if args.database.is_some() {
        config.mysql.database = args.database.clone();
    }

    if let Commands::Copy {
        allow_new_pk,
        allow_no_pk,
        eliminate_dups,
        fail_for_implicit_conv,
        rm_partition,
        no_engine_check,
        enable_outfile_compression,
        chunk_size,
        max_replay_lag,
        additional_where,
        skip_affected_rows_check,
        skip_checksum,
        hooks_dir,
        ..
    } = &args.command
    {
        config.osc.allow_new_pk |= allow_new_pk;
        config.osc.allow_no_pk |= allow_no_pk;
        config.osc.eliminate_dups |= eliminate_dups;
        config.osc.fail_for_implicit_conv |= fail_for_implicit_conv;
        config.osc.rm_partition |= rm_partition;
        config.osc.no_engine_check |= no_engine_check;
        config.osc.enable_outfile_compression |= enable_outfile_compression;
        config.osc.skip_affected_rows_check |= skip_affected_rows_check;
        config.osc.skip_checksum |= skip_checksum;
        if let Some(n) = chunk_size {
            config.osc.chunk_size = *n;
        }
        if let Some(n) = max_replay_lag {
            config.osc.max_replay_lag = *n;
        }
        if additional_where.is_some() {
            config.osc.additional_where = additional_where.clone();
        }
        if hooks_dir.is_some() {
            config.osc.hooks_dir = hooks_dir.clone();
        }
    }
}
