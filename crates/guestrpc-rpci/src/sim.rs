//! A simulated VMX answering RPCI commands.

use std::collections::HashMap;

use guestrpc_message::sim::SimulatedHost;
use guestrpc_transport::Transport;

use crate::guestinfo::GUESTINFO_PREFIX;
use crate::RPCI_PROTOCOL;

/// Responder for [`SimulatedHost::set_responder`] that serves
/// `info-get`/`info-set` from an in-memory key store.
///
/// Keys are stored without the `guestinfo.` prefix. `log` is accepted and
/// ignored; anything else gets a failure reply, as from a real VMX.
pub fn vmx_responder<I, K, V>(
    values: I,
) -> impl FnMut(u32, &[u8]) -> Option<Vec<u8>> + Send + 'static
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut store: HashMap<String, String> = values
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect();

    move |protocol: u32, message: &[u8]| {
        if protocol != RPCI_PROTOCOL {
            return None;
        }
        let command = String::from_utf8_lossy(message);
        let (verb, args) = command.split_once(' ').unwrap_or((&*command, ""));

        let reply = match verb {
            "info-get" => match args
                .strip_prefix(GUESTINFO_PREFIX)
                .and_then(|key| store.get(key))
            {
                Some(value) => format!("1 {value}"),
                None => "0 No value found".to_owned(),
            },
            "info-set" => match args
                .strip_prefix(GUESTINFO_PREFIX)
                .and_then(|rest| rest.split_once(' '))
            {
                Some((key, value)) => {
                    store.insert(key.to_owned(), value.to_owned());
                    "1 ".to_owned()
                }
                None => "0 Two and exactly two arguments expected".to_owned(),
            },
            "log" => "1 ".to_owned(),
            _ => "0 Unknown command".to_owned(),
        };
        Some(reply.into_bytes())
    }
}

/// A transport backed by a [`SimulatedHost`] running [`vmx_responder`].
pub fn simulated_vmx<I, K, V>(values: I) -> Transport<SimulatedHost>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut host = SimulatedHost::new();
    host.set_responder(vmx_responder(values));
    Transport::new(host)
}
