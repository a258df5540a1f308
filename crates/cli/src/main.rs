#![warn(clippy::pedantic)]

use agora::{ChatMessage, ChatRequest, CompletionOptions, Config, RequestInit, Runtime};
use anyhow::{anyhow, bail};
use futures::StreamExt;
use otel::init_tracing;
use tokio::io::{AsyncWriteExt, stdout};
use tracing::info;

mod otel;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const USAGE: &str = "\
Usage: agora [OPTIONS] <COMMAND>

Commands:
  run <script>        Import a script and keep running until interrupted
  eval <code>         Evaluate inline code and print the result
  fetch <url>         Fetch a URL and write the body to stdout
  chat <prompt>       Stream a chat reply from the configured model
  complete <prompt>   Stream a text completion from the configured model
  models              List the models offered by the LLM service

Options:
  --no-http           Do not register the http: protocol
  --no-https          Do not register the https: protocol
  --no-file           Do not register the file: protocol
  --root <dir>        Resolve relative URLs against <dir> (or a URL)
  -a, --autoclose     Close the runtime as soon as the script finishes
  -h, --help          Print this help

Settings are also read from AGORA_* environment variables.";

enum Command {
    Run(String),
    Eval(String),
    Fetch(String),
    Chat(String),
    Complete(String),
    Models,
    Help,
}

#[derive(Default)]
struct Options {
    autoclose: bool,
}

fn parse_args(
    args: impl IntoIterator<Item = String>,
    config: &mut Config,
    options: &mut Options,
) -> anyhow::Result<Command> {
    let mut args = args.into_iter();
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--no-http" => config.protocols.http = false,
            "--no-https" => config.protocols.https = false,
            "--no-file" => config.protocols.file = false,
            "--root" => {
                let root = args.next().ok_or_else(|| anyhow!("--root needs a value"))?;
                config.root = Some(root);
            }
            "-a" | "--autoclose" => options.autoclose = true,
            "-h" | "--help" => return Ok(Command::Help),
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let task = positional.next();
    let rest = positional.collect::<Vec<_>>().join(" ");
    let argument = |name: &str| {
        if rest.is_empty() {
            Err(anyhow!("missing <{name}>"))
        } else {
            Ok(rest.clone())
        }
    };
    match task.as_deref() {
        None => Ok(Command::Help),
        Some("run") => Ok(Command::Run(argument("script")?)),
        Some("eval") => Ok(Command::Eval(argument("code")?)),
        Some("fetch") => Ok(Command::Fetch(argument("url")?)),
        Some("chat") => Ok(Command::Chat(argument("prompt")?)),
        Some("complete") => Ok(Command::Complete(argument("prompt")?)),
        Some("models") => Ok(Command::Models),
        Some(task) => Err(anyhow!("unknown task {task}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _provider = init_tracing()?;

    let mut config = Config::from_env();
    let mut options = Options::default();
    let command = parse_args(std::env::args().skip(1), &mut config, &mut options)?;
    if matches!(command, Command::Help) {
        println!("{USAGE}");
        return Ok(());
    }

    let runtime = Runtime::builder().config(config).build()?;
    let stay_up = matches!(command, Command::Run(_)) && !options.autoclose;
    let result = run(&runtime, command).await;
    if result.is_ok() && stay_up {
        info!("Script loaded, press Ctrl-C to exit");
        tokio::signal::ctrl_c().await?;
    }
    runtime.close().await;
    result
}

async fn run(runtime: &Runtime, command: Command) -> anyhow::Result<()> {
    let mut out = stdout();
    match command {
        Command::Help => {}
        Command::Run(script) => {
            runtime.import(&script).await?;
        }
        Command::Eval(code) => {
            let value = runtime.eval(&code).await?;
            if !value.is_null() {
                out.write_all(format!("{value}\n").as_bytes()).await?;
            }
        }
        Command::Fetch(url) => {
            let response = runtime.fetch(url.as_str(), RequestInit::default()).await?;
            let status = response.status();
            let mut body = response.into_body();
            while let Some(chunk) = body.next().await {
                out.write_all(&chunk.map_err(anyhow::Error::from_boxed)?).await?;
            }
            out.flush().await?;
            if !status.is_success() {
                bail!("{url} responded with {status}");
            }
        }
        Command::Chat(prompt) => {
            let request = ChatRequest::new([ChatMessage::user(prompt)]);
            let mut deltas = runtime.llm().chat_stream(request).await?;
            while let Some(delta) = deltas.next().await {
                if let Some(text) = delta?.content() {
                    out.write_all(text.as_bytes()).await?;
                    out.flush().await?;
                }
            }
            out.write_all(b"\n").await?;
        }
        Command::Complete(prompt) => {
            let mut pieces = runtime
                .llm()
                .complete_stream(&prompt, CompletionOptions::default())
                .await?;
            while let Some(piece) = pieces.next().await {
                out.write_all(piece?.as_bytes()).await?;
                out.flush().await?;
            }
            out.write_all(b"\n").await?;
        }
        Command::Models => {
            for model in runtime.llm().list_models().await? {
                out.write_all(format!("{}\n", model.id).as_bytes()).await?;
            }
        }
    }
    out.flush().await?;
    Ok(())
}
