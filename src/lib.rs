//! Core of the ProxyPal desktop app: installs the CLIProxyAPI binary, runs
//! it as a supervised child process, and polls its management API.

pub mod error;
pub mod events;
pub mod installer;
pub mod management;
pub mod manager;
pub mod oauth;
pub mod proxy;
pub mod refresh;
pub mod settings;

pub use error::{CoreError, CoreResult};
pub use events::{
    BrowserOpener, CoreEvent, EventBus, NotificationEvent, NotificationPreferences, StatusChangeNotifier,
};
pub use installer::{InstallationState, ReleaseInstaller};
pub use management::{AIProvider, HttpManagementClient, ManagementClient};
pub use manager::{Collaborators, ProxyManager};
pub use oauth::{AuthorizationFlowController, OAuthOutcome, OAuthState, OAuthStatus};
pub use proxy::{ConfigSynchronizer, ProcessPhase, ProcessSupervisor, ProxyStatus};
pub use refresh::{QuotaRefreshOutcome, RefreshScheduler, RefreshSnapshot};
pub use settings::{CoreSettings, Paths, RuntimeConfig, SettingsStore};
