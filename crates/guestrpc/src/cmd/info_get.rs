use guestrpc_rpci::GuestInfo;

use crate::backend::ChannelOpts;
use crate::cmd::{bare_key, InfoGetArgs};
use crate::exit::{rpci_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_guestinfo, GuestInfoOutput, OutputFormat};

pub fn run(args: InfoGetArgs, opts: &ChannelOpts, format: OutputFormat) -> CliResult<i32> {
    let key = bare_key(&args.key);
    let info = GuestInfo::with_config(opts.open_transport()?, opts.channel_config());

    let value = info
        .get(key)
        .map_err(|err| rpci_error("info-get failed", err))?;
    let found = value.is_some();
    let shown = value.or(args.default);

    print_guestinfo(
        &GuestInfoOutput {
            schema_id: "guestrpc/cli/v1/guestinfo",
            key,
            found,
            value: shown.as_deref(),
        },
        format,
    );

    // A default stands in for the value, so only a bare miss is a failure.
    if shown.is_some() {
        Ok(SUCCESS)
    } else {
        Ok(FAILURE)
    }
}
