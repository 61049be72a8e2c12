//! CLI lookup subcommand.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};

use clap::Args;

use certquery_core::protocol::{self, CertificateQueryResult};

use crate::client::CertificateClient;

/// Arguments of `certquery lookup`.
#[derive(Args, Debug)]
pub struct LookupArgs {
    /// Student CPF, exactly as stored
    #[arg(long)]
    pub cpf: String,

    /// Student full name, exactly as stored
    #[arg(long)]
    pub nome: String,

    /// Print the raw JSON reply instead of a summary
    #[arg(long)]
    pub json: bool,
}

/// Run a lookup and print the result. Returns whether a certificate was found.
pub async fn handle_lookup(client: &CertificateClient, args: &LookupArgs) -> anyhow::Result<bool> {
    let result = client.query(&args.cpf, &args.nome).await?;
    let mut out = io::stdout();
    write_result(&mut out, &result, args.json)?;
    Ok(result.is_found())
}

/// Render a lookup result for the terminal.
pub fn write_result(
    out: &mut impl Write,
    result: &CertificateQueryResult,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        out.write_all(&protocol::encode_result(result)?)?;
        writeln!(out)?;
        return Ok(());
    }

    match result {
        CertificateQueryResult::Found(details) => {
            writeln!(out, "Certificate found:")?;
            writeln!(out, "  Name:      {}", details.nome)?;
            writeln!(out, "  CPF:       {}", details.cpf)?;
            writeln!(out, "  Completed: {}", details.data_conclusao)?;
            writeln!(out, "  Score:     {}", details.nota)?;
        }
        CertificateQueryResult::NotFound => {
            writeln!(out, "{}", protocol::NOT_FOUND_MESSAGE)?;
        }
    }
    Ok(())
}
