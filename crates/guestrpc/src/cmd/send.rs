use std::fs;

use guestrpc_rpci::send_one_with_config;

use crate::backend::ChannelOpts;
use crate::cmd::SendArgs;
use crate::exit::{io_error, rpci_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: SendArgs, opts: &ChannelOpts, format: OutputFormat) -> CliResult<i32> {
    let command = resolve_command(&args)?;
    let transport = opts.open_transport()?;

    let reply = send_one_with_config(&transport, &command, opts.channel_config())
        .map_err(|err| rpci_error("send failed", err))?;
    print_reply(&command, &reply, format);

    if reply.ok {
        Ok(SUCCESS)
    } else {
        Ok(FAILURE)
    }
}

fn resolve_command(args: &SendArgs) -> CliResult<String> {
    let command = match (&args.command, &args.file) {
        (Some(command), _) => command.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .map(|text| text.trim_end_matches(['\r', '\n']).to_string())
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?,
        (None, None) => String::new(),
    };

    if command.is_empty() {
        return Err(CliError::new(USAGE, "RPCI command must not be empty"));
    }
    Ok(command)
}
