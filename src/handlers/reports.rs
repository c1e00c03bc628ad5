use super::{AppState, Pagination};
use crate::errors::ServiceError;
use crate::services::stock_ledger::{LedgerDocumentType, LedgerFilters};
use axum::{
    extract::{Json, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct StockLedgerQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub product_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub supplier_id: Option<Uuid>,
    pub document_number: Option<String>,
    /// Comma-separated document families, e.g. `sale,sale_return`.
    pub document_types: Option<String>,
}

fn parse_document_types(
    raw: Option<&str>,
) -> Result<Option<Vec<LedgerDocumentType>>, ServiceError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut types = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let parsed = LedgerDocumentType::from_str(part).map_err(|_| {
            ServiceError::ValidationError(format!("Unknown document type: {}", part))
        })?;
        if !types.contains(&parsed) {
            types.push(parsed);
        }
    }
    if types.is_empty() {
        return Ok(None);
    }
    Ok(Some(types))
}

async fn stock_ledger(
    State(state): State<AppState>,
    Query(query): Query<StockLedgerQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    if let (Some(from), Some(to)) = (query.from_date, query.to_date) {
        if from > to {
            return Err(ServiceError::ValidationError(
                "from_date cannot be after to_date".to_string(),
            ));
        }
    }
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let filters = LedgerFilters {
        from_date: query.from_date,
        to_date: query.to_date,
        product_id: query.product_id,
        customer_id: query.customer_id,
        supplier_id: query.supplier_id,
        document_number: query.document_number,
        document_types: parse_document_types(query.document_types.as_deref())?,
    };
    let report = state
        .services
        .stock_ledger
        .build_report(&filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(report))
}

pub fn report_routes() -> Router<AppState> {
    Router::new().route("/stock-ledger", get(stock_ledger))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_list_parses_and_dedupes() {
        let parsed = parse_document_types(Some("sale, sale_return,sale")).unwrap();
        assert_eq!(
            parsed,
            Some(vec![
                LedgerDocumentType::Sale,
                LedgerDocumentType::SaleReturn
            ])
        );
    }

    #[test]
    fn empty_document_type_list_means_no_filter() {
        assert_eq!(parse_document_types(None).unwrap(), None);
        assert_eq!(parse_document_types(Some(" , ")).unwrap(), None);
    }

    #[test]
    fn unknown_document_type_is_rejected() {
        let err = parse_document_types(Some("refund")).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }
}
