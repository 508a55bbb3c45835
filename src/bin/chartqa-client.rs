use argh::FromArgs;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chartqa_infernum::messages::AnalyzeRequest;
use std::path::PathBuf;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5001;

#[derive(FromArgs)]
/// Chart QA client for checking the server and asking questions
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "health", "status" or "analyze"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Health(HealthCommand),
    Status(StatusCommand),
    Analyze(AnalyzeCommand),
}

#[derive(FromArgs)]
/// Check that the server is up
#[argh(subcommand, name = "health")]
struct HealthCommand {}

#[derive(FromArgs)]
/// Show the loaded model
#[argh(subcommand, name = "status")]
struct StatusCommand {}

#[derive(FromArgs)]
/// Ask a question about a chart image
#[argh(subcommand, name = "analyze")]
struct AnalyzeCommand {
    /// the path to the chart image
    #[argh(option, short = 'i')]
    image: PathBuf,

    /// the question to ask
    #[argh(option, short = 'q')]
    question: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let response = match args.command {
        ClientCommands::Health(_) => client.get(format!("http://{}/health", addr)).send().await?,
        ClientCommands::Status(_) => client.get(format!("http://{}/status", addr)).send().await?,
        ClientCommands::Analyze(command) => {
            let bytes = tokio::fs::read(&command.image).await?;
            client
                .post(format!("http://{}/analyze", addr))
                .json(&AnalyzeRequest {
                    image: Some(STANDARD.encode(bytes)),
                    question: Some(command.question),
                })
                .send()
                .await?
        }
    };

    let status = response.status();
    let result = response.json::<serde_json::Value>().await?;
    println!("Status: {status}");
    println!("Result: {}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
