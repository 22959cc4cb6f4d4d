use serde::Serialize;

pub const DEFAULT_PER_PAGE: i64 = 10;
pub const MAX_PER_PAGE: i64 = 100;
/// Highest page whose offset still fits in an `i64`.
pub const MAX_PAGE: i64 = i64::MAX / MAX_PER_PAGE;

/// Resolved `?pagina=&cantidad_por_pagina=`.
///
/// Query structs carry the two raw fields themselves instead of flattening a
/// shared struct; urlencoded flattening loses the numeric types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub per_page: i64,
}

impl PageRequest {
    pub fn new(pagina: Option<i64>, cantidad_por_pagina: Option<i64>) -> Self {
        PageRequest {
            page: pagina.unwrap_or(1).clamp(1, MAX_PAGE),
            per_page: cantidad_por_pagina
                .unwrap_or(DEFAULT_PER_PAGE)
                .clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.per_page
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PageInfo {
    pub total_items: i64,
    pub total_paginas: i64,
    pub cantidad_por_pagina: i64,
    pub pagina_actual: i64,
}

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub paginacion: PageInfo,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, total_items: i64, req: PageRequest) -> Self {
        let total_items = total_items.max(0);
        Self {
            items,
            paginacion: PageInfo {
                total_items,
                total_paginas: (total_items + req.per_page - 1) / req.per_page,
                cantidad_por_pagina: req.per_page,
                pagina_actual: req.page,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pagina: Option<i64>, cantidad: Option<i64>) -> PageRequest {
        PageRequest::new(pagina, cantidad)
    }

    #[test]
    fn defaults_and_clamping() {
        let r = query(None, None);
        assert_eq!(r, PageRequest { page: 1, per_page: 10 });

        let r = query(Some(0), Some(1000));
        assert_eq!(r, PageRequest { page: 1, per_page: 100 });

        let r = query(Some(-3), Some(0));
        assert_eq!(r, PageRequest { page: 1, per_page: 1 });
    }

    #[test]
    fn offset_follows_page() {
        let r = query(Some(3), Some(20));
        assert_eq!(r.offset(), 40);
        assert_eq!(r.limit(), 20);
    }

    #[test]
    fn huge_page_is_capped() {
        let r = query(Some(i64::MAX), Some(10));
        assert_eq!(r.page, MAX_PAGE);
        assert!(r.offset() > 0);

        let r = query(Some(i64::MAX), Some(MAX_PER_PAGE));
        assert_eq!(r.offset(), (MAX_PAGE - 1) * MAX_PER_PAGE);
    }

    #[test]
    fn envelope_counts_pages() {
        let req = PageRequest { page: 2, per_page: 10 };
        let p = Paginated::new(vec![1, 2, 3], 23, req);
        assert_eq!(
            p.paginacion,
            PageInfo {
                total_items: 23,
                total_paginas: 3,
                cantidad_por_pagina: 10,
                pagina_actual: 2,
            }
        );

        let empty: Paginated<i32> = Paginated::new(vec![], 0, req);
        assert_eq!(empty.paginacion.total_paginas, 0);

        let exact: Paginated<i32> = Paginated::new(vec![], 20, req);
        assert_eq!(exact.paginacion.total_paginas, 2);
    }
}
