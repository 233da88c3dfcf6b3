use stress_test::{stress_test_documents, stress_test_scaling};
use tracing_subscriber::EnvFilter;
pub mod stress_test;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };
    if !rt.block_on(async_main()) {
        std::process::exit(1);
    }
}

async fn async_main() -> bool {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            DOCUMENT CONVERGENCE STRESS TESTS                ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut converged = true;

    // Small scale
    let stats = stress_test_documents(4, 100, 200).await;
    stats.print();
    converged &= stats.converged;

    // Medium scale
    let stats = stress_test_documents(10, 300, 1000).await;
    stats.print();
    converged &= stats.converged;

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    converged &= stress_test_scaling(12, 4).await;

    if converged {
        println!("\n✓ All stress tests converged!");
    } else {
        println!("\n✗ Divergence detected");
    }
    converged
}
