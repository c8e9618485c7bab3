use jobflow::store::{DocumentQuery, Filter, PageToken, SortOrder, StoreError};
use sqlx::{Postgres, QueryBuilder};

pub(crate) trait ToQuery {
    fn query(&self) -> Result<QueryBuilder<'_, Postgres>, StoreError>;
}

impl ToQuery for DocumentQuery {
    fn query(&self) -> Result<QueryBuilder<'_, Postgres>, StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT path, date_created, document FROM jobflow_documents WHERE parent = ",
        );
        builder.push_bind(self.path.trim_end_matches('/'));
        builder.push(" AND");
        handle_filter(&mut builder, &self.filter);

        let (comparison, direction) = match self.sort_order {
            SortOrder::Ascending => (">", "ASC"),
            SortOrder::Descending => ("<", "DESC"),
        };
        if let Some(page_token) = &self.page_token {
            let (created, path) = PageToken::decode(page_token)?;
            builder.push(format!(" AND (date_created, path) {comparison} ("));
            builder.push_bind(created);
            builder.push(", ");
            builder.push_bind(path);
            builder.push(")");
        }

        builder.push(format!(" ORDER BY date_created {direction}, path {direction}"));
        if let Some(page_size) = self.page_size {
            // One extra row tells whether another page follows.
            builder.push(" LIMIT ");
            builder.push_bind(page_size as i64 + 1);
        }
        Ok(builder)
    }
}

fn handle_filter<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a Filter) {
    match filter {
        Filter::Not(inner) => {
            builder.push(" NOT");
            handle_filter(builder, inner);
        }
        Filter::And(filters) => join(builder, filters, " AND", " TRUE"),
        Filter::Or(filters) => join(builder, filters, " OR", " FALSE"),
        Filter::StatusEqual(status) => {
            builder.push(" status = ");
            builder.push_bind(status);
        }
        Filter::CreatedFrom(from) => {
            builder.push(" date_created >= ");
            builder.push_bind(from);
        }
        Filter::CreatedTo(to) => {
            builder.push(" date_created <= ");
            builder.push_bind(to);
        }
    }
}

fn join<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    filters: &'a [Filter],
    separator: &str,
    empty: &str,
) {
    let Some((last, elements)) = filters.split_last() else {
        builder.push(empty);
        return;
    };
    builder.push(" (");
    elements.iter().for_each(|filter| {
        handle_filter(builder, filter);
        builder.push(separator);
    });
    handle_filter(builder, last);
    builder.push(")");
}
