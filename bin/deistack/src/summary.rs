//! Terminal output for plans and finished runs.

use comfy_table::{Table, presets::UTF8_FULL};
use deistack_deploy::{
    DeploymentPlan, DeploymentReport, DeploymentSpec,
    plan::UnitTemplate,
    roles::GrantOutcome,
};

pub fn print_plan(spec: &DeploymentSpec, plan: &DeploymentPlan) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["#", "Unit", "Kind", "Depends on"]);

    for (i, unit) in plan.units().iter().enumerate() {
        let kind = match &unit.template {
            UnitTemplate::Contract { contract, .. } => contract.clone(),
            UnitTemplate::Pair(pair) => format!("pair {}/{}", pair.token_a.token, pair.token_b.token),
        };
        table.add_row(vec![
            (i + 1).to_string(),
            unit.name.clone(),
            kind,
            unit.dependencies.join(", "),
        ]);
    }

    println!("{table}");
    println!(
        "{} units, {} configuration steps, {} nonce skips on `{}` ({})",
        plan.units().len(),
        spec.configure.len(),
        spec.sync.len(),
        spec.network.name,
        spec.network.environment,
    );
}

pub fn print_report(report: &DeploymentReport) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Unit", "Kind", "Address"]);
    for unit in &report.units {
        table.add_row(vec![
            unit.name.clone(),
            unit.kind.clone(),
            unit.address.to_string(),
        ]);
    }
    println!("{table}");

    println!(
        "Network `{}` (chain {}), signer {}: {} transactions sent, next nonce {}",
        report.network,
        report.chain_id,
        report.signer,
        report.transactions,
        report.final_nonce,
    );

    if let Some(verification) = &report.verification {
        println!(
            "Verification: {}/{} verified{}",
            verification.verified,
            verification.requested,
            if verification.failed.is_empty() {
                String::new()
            } else {
                format!(", failed: {}", verification.failed.join(", "))
            }
        );
    }

    if let Some(handover) = &report.handover {
        let granted = handover
            .granted
            .iter()
            .filter(|(_, outcome)| *outcome == GrantOutcome::Granted)
            .count();
        println!(
            "Handover: admin role granted on {} units ({} already held), {} balances swept, {} renounced",
            granted,
            handover.granted.len() - granted,
            handover.swept.len(),
            handover.renounced.len(),
        );
    }

    println!("Output written to {}", report.outdata.display());
}
