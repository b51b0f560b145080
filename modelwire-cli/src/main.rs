use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use modelwire_core::Protocol;
use modelwire_core::ReportSection;
use modelwire_core::SetType;
use modelwire_core::Workbench;
use std::path::PathBuf;

mod commands;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliProtocol {
    TrainTest,
    CrossFold,
}

impl From<CliProtocol> for Protocol {
    fn from(protocol: CliProtocol) -> Self {
        match protocol {
            CliProtocol::TrainTest => Protocol::TrainTest,
            CliProtocol::CrossFold => Protocol::CrossFold,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSet {
    Train,
    Test,
    TrainTest,
}

impl From<CliSet> for SetType {
    fn from(set: CliSet) -> Self {
        match set {
            CliSet::Train => SetType::Train,
            CliSet::Test => SetType::Test,
            CliSet::TrainTest => SetType::TrainTest,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSection {
    Metrics,
    Attributes,
    Features,
    Classifier,
    Context,
}

impl From<CliSection> for ReportSection {
    fn from(section: CliSection) -> Self {
        match section {
            CliSection::Metrics => ReportSection::Metrics,
            CliSection::Attributes => ReportSection::Attributes,
            CliSection::Features => ReportSection::Features,
            CliSection::Classifier => ReportSection::Classifier,
            CliSection::Context => ReportSection::Context,
        }
    }
}

#[derive(Parser)]
#[command(name = "modelwire")]
#[command(about = "Train, evaluate and serve configured classification models", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[arg(long, short, global = true, help = "Show verbose debug output")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show configuration paths and configured models")]
    Info,

    #[command(about = "Train a model, persist it and write its reports")]
    Train {
        #[arg(help = "Model name")]
        model: String,

        #[arg(long, value_enum, default_value = "train-test", help = "Evaluation protocol")]
        protocol: CliProtocol,
    },

    #[command(about = "Evaluate a model without persisting it")]
    Evaluate {
        #[arg(help = "Model name")]
        model: String,

        #[arg(long, value_enum, default_value = "train-test", help = "Evaluation protocol")]
        protocol: CliProtocol,

        #[arg(long, help = "Print the evaluation as JSON")]
        json: bool,
    },

    #[command(about = "Rank the feature combinations of a feature set group")]
    Sweep {
        #[arg(help = "Model name")]
        model: String,

        #[arg(help = "Feature set group name")]
        group: String,

        #[arg(long, value_enum, default_value = "train-test", help = "Evaluation protocol")]
        protocol: CliProtocol,
    },

    #[command(about = "Classify one input with a trained model")]
    Classify {
        #[arg(help = "Model name")]
        model: String,

        #[arg(long, help = "Input JSON object (reads from stdin if omitted)")]
        input: Option<String>,
    },

    #[command(about = "Predict a dataset (or a file of inputs) and write a predictions CSV")]
    Predict {
        #[arg(help = "Model name")]
        model: String,

        #[arg(long, value_enum, default_value = "test", help = "Configured dataset to predict")]
        set: CliSet,

        #[arg(long, help = "Predict feature maps from this file or directory instead")]
        inputs: Option<PathBuf>,
    },

    #[command(about = "Describe a trained model")]
    Describe {
        #[arg(help = "Model name")]
        model: String,

        #[arg(long, value_enum, value_delimiter = ',', help = "Sections to include")]
        sections: Vec<CliSection>,
    },

    #[command(about = "Manage datasets")]
    Datasets {
        #[command(subcommand)]
        command: DatasetCommands,
    },
}

#[derive(Subcommand)]
enum DatasetCommands {
    #[command(about = "Convert a JSON file or directory of JSON files to JSONL")]
    Convert {
        #[arg(help = "Input path (.json file, .jsonl file or directory of .json files)")]
        input: PathBuf,

        #[arg(long, short, help = "Output path (defaults to the input with a .jsonl extension)")]
        output: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool, configured: Option<&str>) {
    let level = if verbose {
        "debug"
    } else {
        configured.unwrap_or("warn")
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .try_init();
    log::debug!("default log filter '{level}'");
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let bench = Workbench::load("modelwire")?;
    init_logging(cli.verbose, bench.settings().logging.level.as_deref());
    log::debug!(
        "loaded settings from {} ({} models)",
        bench.paths().config_file.display(),
        bench.settings().models.len()
    );

    match cli.command {
        Commands::Info => commands::handle_info(&bench)?,
        Commands::Train { model, protocol } => {
            commands::handle_train(&bench, &model, protocol.into())?;
        }
        Commands::Evaluate {
            model,
            protocol,
            json,
        } => {
            commands::handle_evaluate(&bench, &model, protocol.into(), json)?;
        }
        Commands::Sweep {
            model,
            group,
            protocol,
        } => {
            commands::handle_sweep(&bench, &model, &group, protocol.into())?;
        }
        Commands::Classify { model, input } => {
            commands::handle_classify(&bench, &model, input.as_deref())?;
        }
        Commands::Predict { model, set, inputs } => {
            commands::handle_predict(&bench, &model, set.into(), inputs.as_deref())?;
        }
        Commands::Describe { model, sections } => {
            let sections = (!sections.is_empty())
                .then(|| sections.into_iter().map(ReportSection::from).collect());
            commands::handle_describe(&bench, &model, sections)?;
        }
        Commands::Datasets { command } => match command {
            DatasetCommands::Convert { input, output } => {
                commands::handle_dataset_convert(&input, output.as_deref())?;
            }
        },
    }

    Ok(())
}
