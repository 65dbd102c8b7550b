use rebus_core::IntegrationEvent;
use rebus_macros::integration_event;

#[integration_event(name = "billing.invoice_paid")]
#[derive(PartialEq)]
struct InvoicePaid {
    invoice_no: String,
    amount_cents: i64,
}

fn main() {
    assert_eq!(InvoicePaid::EVENT_TYPE, "billing.invoice_paid");
}
