use std::collections::BTreeMap;

use anyhow::{anyhow, bail};

use crate::error::{PipeError, PipeResult};
use crate::pipe::message::Domain;
use crate::pipe::protocol::{Allowance, Brochure, Offer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub transport: String,
    pub channels: BTreeMap<Domain, String>,
}

/// Picks a transport, and a channel for every domain the client listed.
///
/// The server's preference wins: the choice is the first entry in the server's (priority
///  ordered) list that the client offers as well, with an equal domain descriptor. This depends
///  only on the two brochures, so both peers get the same result from the same input.
///
/// Domains without a common channel are left out. An empty transport intersection fails the
///  handshake.
pub(crate) fn negotiate(client: &Brochure, server: &Brochure) -> PipeResult<Negotiated> {
    let transport = first_common(&server.transports, &client.transports)
        .ok_or_else(|| PipeError::Handshake(format!(
            "no common transport - client offers {:?}, server offers {:?}",
            names(&client.transports),
            names(&server.transports),
        )))?;

    let mut channels = BTreeMap::new();
    for (domain, client_offers) in &client.channels {
        let Some(server_offers) = server.channels.get(domain) else {
            continue;
        };
        if let Some(channel) = first_common(server_offers, client_offers) {
            channels.insert(domain.clone(), channel.name.clone());
        }
    }

    Ok(Negotiated {
        transport: transport.name.clone(),
        channels,
    })
}

fn first_common<'a>(preferred: &'a [Offer], other: &[Offer]) -> Option<&'a Offer> {
    preferred.iter()
        .find(|offer| other.contains(offer))
}

fn names(offers: &[Offer]) -> Vec<&str> {
    offers.iter()
        .map(|o| o.name.as_str())
        .collect()
}

/// The client's check that the server chose from what was offered
pub(crate) fn validate_allowance(brochure: &Brochure, allowance: &Allowance) -> anyhow::Result<()> {
    if !brochure.transports.iter().any(|t| t.name == allowance.transport) {
        bail!("server chose transport {} which was not offered", allowance.transport);
    }

    for (domain, selection) in &allowance.channels {
        let offers = brochure.channels.get(domain)
            .ok_or_else(|| anyhow!("server chose a channel for domain {} which was not offered", domain))?;
        if !offers.iter().any(|o| o.name == selection.channel) {
            bail!("server chose channel {} for domain {} which was not offered", selection.channel, domain);
        }
    }
    Ok(())
}
