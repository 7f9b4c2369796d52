use guestrpc_rpci::GuestInfo;
use tracing::info;

use crate::backend::ChannelOpts;
use crate::cmd::{bare_key, InfoSetArgs};
use crate::exit::{rpci_error, CliResult, SUCCESS};
use crate::output::{print_guestinfo, GuestInfoOutput, OutputFormat};

pub fn run(args: InfoSetArgs, opts: &ChannelOpts, format: OutputFormat) -> CliResult<i32> {
    let key = bare_key(&args.key);
    let info = GuestInfo::with_config(opts.open_transport()?, opts.channel_config());

    info.set(key, &args.value)
        .map_err(|err| rpci_error("info-set failed", err))?;
    info!(key, "guestinfo value set");

    print_guestinfo(
        &GuestInfoOutput {
            schema_id: "guestrpc/cli/v1/guestinfo",
            key,
            found: true,
            value: Some(&args.value),
        },
        format,
    );
    Ok(SUCCESS)
}
