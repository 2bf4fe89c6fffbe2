//! Inbound requests and the pending requests they become once registered.

use std::{
    collections::HashSet,
    fmt::{self, Debug, Formatter},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    completion::{CompletionCell, CompletionHandle},
    error::{self, Error},
    key,
    processor::Category,
};

/// How long a request waits when it doesn't set its own timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

type Function<T> = Arc<dyn Fn(Option<&str>) -> anyhow::Result<T> + Send + Sync>;
type Supplier<T> = Arc<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

/// The backend query behind a request. Exactly one of the two forms.
pub(crate) enum UnitOfWork<T> {
    Apply {
        function: Function<T>,
        argument: Option<String>,
    },
    Supply(Supplier<T>),
}

impl<T> Clone for UnitOfWork<T> {
    fn clone(&self) -> Self {
        match self {
            UnitOfWork::Apply { function, argument } => UnitOfWork::Apply {
                function: Arc::clone(function),
                argument: argument.clone(),
            },
            UnitOfWork::Supply(supplier) => UnitOfWork::Supply(Arc::clone(supplier)),
        }
    }
}

impl<T> UnitOfWork<T> {
    /// Run the user's closure. A panic is reported as an error.
    pub(crate) fn run(&self) -> anyhow::Result<T> {
        let outcome = error::catch_panic(|| match self {
            UnitOfWork::Apply { function, argument } => function(argument.as_deref()),
            UnitOfWork::Supply(supplier) => supplier(),
        });

        outcome.unwrap_or_else(|message| Err(anyhow::anyhow!("panicked: {message}")))
    }
}

impl<T> Debug for UnitOfWork<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UnitOfWork::Apply { argument, .. } => f
                .debug_struct("Apply")
                .field("function", &"<closure>")
                .field("argument", argument)
                .finish(),
            UnitOfWork::Supply(..) => f.debug_tuple("Supply").field(&"<closure>").finish(),
        }
    }
}

/// A request as handed over by the transport, before registration.
///
/// ```
/// use pollcoalesce::{Category, QueryRequest};
/// use std::time::Duration;
///
/// let request: QueryRequest<Vec<String>> = QueryRequest::new("FLIGHT_LIST")
///     .param("42")
///     .user("u-7", "d-3")
///     .timeout(Duration::from_secs(30))
///     .accept(Category::FILTER)
///     .function(|param| Ok(vec![param.unwrap_or_default().to_owned()]));
/// ```
pub struct QueryRequest<T> {
    pub(crate) view_code: String,
    pub(crate) param: Option<String>,
    pub(crate) submitted_at: Option<Instant>,
    pub(crate) user_id: Option<String>,
    pub(crate) dept_id: Option<String>,
    pub(crate) function: Option<Function<T>>,
    pub(crate) supplier: Option<Supplier<T>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) timeout_value: Option<T>,
    pub(crate) categories: HashSet<Category>,
}

impl<T> QueryRequest<T> {
    /// Create a request for `view_code`, submitted now.
    pub fn new(view_code: impl Into<String>) -> Self {
        Self {
            view_code: view_code.into(),
            param: None,
            submitted_at: Some(Instant::now()),
            user_id: None,
            dept_id: None,
            function: None,
            supplier: None,
            timeout: None,
            timeout_value: None,
            categories: HashSet::new(),
        }
    }

    /// The request parameter. It specializes the view key and is also the
    /// argument passed to a [`function`](QueryRequest::function).
    pub fn param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Override the submission time. `None` makes the request invalid.
    pub fn submitted_at(mut self, submitted_at: Option<Instant>) -> Self {
        self.submitted_at = submitted_at;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>, dept_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.dept_id = Some(dept_id.into());
        self
    }

    /// Compute the result by calling `function` with the request parameter.
    pub fn function(
        mut self,
        function: impl Fn(Option<&str>) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.function = Some(Arc::new(function));
        self
    }

    /// Compute the result by calling `supplier`.
    pub fn supplier(mut self, supplier: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static) -> Self {
        self.supplier = Some(Arc::new(supplier));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The value delivered if the request times out.
    pub fn timeout_value(mut self, value: T) -> Self {
        self.timeout_value = Some(value);
        self
    }

    /// Accept post-processing by processors of this category.
    pub fn accept(mut self, category: Category) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn view_code(&self) -> &str {
        &self.view_code
    }

    pub(crate) fn unit_of_work(&self) -> Result<UnitOfWork<T>, Error> {
        match (&self.function, &self.supplier) {
            (Some(function), None) => Ok(UnitOfWork::Apply {
                function: Arc::clone(function),
                argument: self.param.clone(),
            }),
            (None, Some(supplier)) => Ok(UnitOfWork::Supply(Arc::clone(supplier))),
            (None, None) => Err(Error::InvalidRequest("no function or supplier given")),
            (Some(..), Some(..)) => Err(Error::InvalidRequest(
                "both a function and a supplier were given",
            )),
        }
    }
}

impl<T> Debug for QueryRequest<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRequest")
            .field("view_code", &self.view_code)
            .field("param", &self.param)
            .field("submitted_at", &self.submitted_at)
            .field("user_id", &self.user_id)
            .field("dept_id", &self.dept_id)
            .field("timeout", &self.timeout)
            .field("categories", &self.categories)
            .finish()
    }
}

/// A registered request, waiting in its view's queue for a result.
pub struct PendingRequest<T> {
    view_key: String,
    param: Option<String>,
    submitted_at: Option<Instant>,
    user_id: Option<String>,
    dept_id: Option<String>,
    categories: HashSet<Category>,
    cell: CompletionCell<T>,
}

impl<T: Clone> PendingRequest<T> {
    /// Register `request`, creating its completion cell. Returns the pending
    /// request and the handle its caller waits on.
    pub(crate) fn register(
        request: QueryRequest<T>,
        default_timeout: Duration,
    ) -> (Self, CompletionHandle<T>) {
        let QueryRequest {
            view_code,
            param,
            submitted_at,
            user_id,
            dept_id,
            timeout,
            timeout_value,
            categories,
            ..
        } = request;

        let cell = CompletionCell::new(timeout.unwrap_or(default_timeout), timeout_value);
        let handle = cell.handle();

        let pending = PendingRequest {
            view_key: key::wrap(&view_code, param.as_deref()),
            param,
            submitted_at,
            user_id,
            dept_id,
            categories,
            cell,
        };

        (pending, handle)
    }
}

impl<T> PendingRequest<T> {
    /// The view key (view code plus parameter) this request waits on.
    pub fn view_key(&self) -> &str {
        &self.view_key
    }

    pub fn param(&self) -> Option<&str> {
        self.param.as_deref()
    }

    pub fn submitted_at(&self) -> Option<Instant> {
        self.submitted_at
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn dept_id(&self) -> Option<&str> {
        self.dept_id.as_deref()
    }

    /// Whether this request accepts post-processing of `category`.
    pub fn accepts(&self, category: &Category) -> bool {
        self.categories.contains(category)
    }

    pub(crate) fn cell(&self) -> &CompletionCell<T> {
        &self.cell
    }
}

impl<T: Debug> Debug for PendingRequest<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("view_key", &self.view_key)
            .field("submitted_at", &self.submitted_at)
            .field("user_id", &self.user_id)
            .field("dept_id", &self.dept_id)
            .field("categories", &self.categories)
            .field("cell", &self.cell)
            .finish()
    }
}
