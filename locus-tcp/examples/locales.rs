//! Print each rank's place in the two-level topology.
//!
//! Launch one process per rank, e.g. under OpenMPI:
//!
//! ```bash
//! LOCUS_HUB_ADDR=node0:7400 mpirun -n 8 cargo run --example locales
//! ```
//!
//! or by hand, with `LOCUS_RANK` and `LOCUS_WORLD_SIZE` set per process.

use locus::{Connection, LocusConfig};
use locus_tcp::TcpSubstrate;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let substrate = TcpSubstrate::from_env()?;
    let mut conn = Connection::connect(substrate, LocusConfig::from_env())?;

    println!(
        "rank {}/{} on {}: locale {}/{}, locale rank {}/{}{}",
        conn.rank(),
        conn.size(),
        conn.hostname()?,
        conn.locale(),
        conn.locales(),
        conn.locale_rank(),
        conn.locale_size(),
        if conn.is_locale_lead() { " (lead)" } else { "" },
    );

    conn.barrier()?;
    conn.finalize()?;
    Ok(())
}
