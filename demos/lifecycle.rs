//! Walks an expense voucher and a set of meeting minutes through their
//! approval lifecycles against a throwaway store.
use docflow::config::{EngineConfig, StoreConfig};
use docflow::{Action, Actor, DocumentKind, DocumentPayload, DocumentService, Money, Percent, Role, SledStore, telemetry};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load()?;
    telemetry::init(&config.logging)?;

    let store = Arc::new(SledStore::open(&StoreConfig::temporary())?);
    let service = DocumentService::new(store.clone(), &config)?;

    let accountant = Actor::new("acc_01", Role::Accountant);
    let principal = Actor::new("pri_01", Role::Principal);
    let admin = Actor::new("adm_01", Role::Admin);
    let vp = Actor::new("vp_01", Role::VicePrincipal);

    let voucher = service.create(
        DocumentKind::ExpenseLog,
        DocumentPayload::new()
            .set_field("category", "Stationery")
            .set_field("paid_to", "City Book Depot")
            .set_amount(Money::from(1000))
            .set_tax_applicable(true)
            .set_tax_rate(Percent::from(18))
            .set_tax_number("27ABCDE1234F1Z5"),
        &accountant,
    )?;
    if let Some(financials) = &voucher.financials {
        println!(
            "{} created: base {} cgst {} sgst {} total {}",
            voucher.human_number,
            financials.amount,
            financials.cgst(),
            financials.sgst(),
            financials.total_amount()
        );
    }

    let voucher = service.transition(&voucher.id, Action::Approve, &principal, Some("within budget".into()))?;
    let voucher = service.transition(&voucher.id, Action::Pay, &accountant, None)?;
    println!("{} is now {}", voucher.human_number, voucher.status);

    let minutes = service.create(
        DocumentKind::MeetingMinutes,
        DocumentPayload::new()
            .set_field("title", "Staff meeting")
            .set_field("meeting_date", "2024-05-02")
            .set_field("attendees", "Admin, VP, Principal"),
        &admin,
    )?;
    service.transition(&minutes.id, Action::Submit, &admin, None)?;
    service.transition(&minutes.id, Action::VpApprove, &vp, None)?;
    let minutes = service.transition(&minutes.id, Action::PrincipalApprove, &principal, Some("noted".into()))?;

    for approval in service.history(&minutes.id)? {
        println!(
            "{}: {} {} -> {} by {}",
            minutes.human_number, approval.action, approval.from, approval.to, approval.role
        );
    }

    let health = store.health_check()?;
    println!("{} records, {} counters", health.records, health.counters);

    drop(service);
    match Arc::try_unwrap(store) {
        Ok(store) => {
            store.shutdown()?;
        }
        Err(_) => anyhow::bail!("store still shared at shutdown"),
    }
    Ok(())
}
